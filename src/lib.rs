//! GenICam input node
//!
//! A node for image-processing node graphs that acquires frames from GenICam
//! industrial cameras through GenTL producers and exposes them on an image
//! output socket.
//!
//! # Module Structure
//!
//! - `config`: GenTL search path and shared node settings
//! - `gentl`: producer loading, device discovery, camera acquisition
//! - `frame` / `demosaic`: raw sensor buffers and their RGB conversion
//! - `texture`: display texture shared with the renderer
//! - `editor`: host editor contract and an in-memory implementation
//! - `node`: node lifecycle and `GenICamInputNode`

pub mod config;
pub mod demosaic;
pub mod editor;
mod error;
pub mod frame;
pub mod gentl;
pub mod node;
pub mod texture;

pub use config::{GenTlPath, SharedConfig, GENTL_PATH_ENV};
pub use editor::{HeadlessEditor, NodeEditor};
pub use error::NodeError;
pub use frame::RawFrame;
pub use gentl::{Camera, CameraStats, DeviceInfo, DeviceRegistry};
pub use node::{
    evaluate_contained, Connection, GenICamInputNode, ImageMap, Node, NodeOutput, NodeSettings,
    ResultMap,
};
pub use texture::{DisplayTexture, SharedTexture};
