//! Node lifecycle shared by every node type of the editor.
//!
//! The host calls `build` once per node instance, `evaluate` on every tick,
//! `close` when the node is deleted, and the settings hooks when the graph is
//! saved or loaded. Per-tick data flows through caller-owned maps keyed by
//! node tag.

mod genicam;

use std::collections::HashMap;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::SharedConfig;
use crate::editor::NodeEditor;
use crate::NodeError;

pub use genicam::{GenICamInputNode, NODE_LABEL, NODE_TAG, NODE_VERSION};

/// Link between an output attribute and an input attribute, by tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub source: String,
    pub destination: String,
}

/// Latest image produced by each node, keyed by node tag.
pub type ImageMap = HashMap<String, RgbImage>;
/// Latest non-image result of each node, keyed by node tag.
pub type ResultMap = HashMap<String, serde_json::Value>;

/// What a node hands back from one tick.
#[derive(Clone, Debug, Default)]
pub struct NodeOutput {
    pub image: Option<RgbImage>,
    pub result: Option<serde_json::Value>,
}

impl NodeOutput {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.result.is_none()
    }
}

/// Persisted node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub ver: String,
    pub pos: [f32; 2],
}

pub trait Node {
    fn label(&self) -> &'static str;

    fn tag(&self) -> &'static str;

    /// Registers the node's widgets and textures; returns the node tag.
    fn build(
        &mut self,
        editor: &mut dyn NodeEditor,
        parent: &str,
        node_id: u32,
        pos: [f32; 2],
        config: &SharedConfig,
    ) -> Result<String, NodeError>;

    fn evaluate(
        &mut self,
        editor: &mut dyn NodeEditor,
        node_id: u32,
        connections: &[Connection],
        images: &ImageMap,
        results: &ResultMap,
    ) -> Result<NodeOutput, NodeError>;

    fn close(&mut self, node_id: u32) -> Result<(), NodeError>;

    fn settings(&self, editor: &dyn NodeEditor, node_id: u32) -> Result<NodeSettings, NodeError>;

    fn set_settings(&mut self, node_id: u32, settings: &serde_json::Value);
}

/// Evaluates `node`, turning a failure into an empty output.
///
/// This is the host's per-node containment: a node that fails a tick only
/// skips its own output and is evaluated again on the next tick.
pub fn evaluate_contained(
    node: &mut dyn Node,
    editor: &mut dyn NodeEditor,
    node_id: u32,
    connections: &[Connection],
    images: &ImageMap,
    results: &ResultMap,
) -> NodeOutput {
    match node.evaluate(editor, node_id, connections, images, results) {
        Ok(output) => output,
        Err(err) => {
            log::warn!("{}:{} evaluation failed: {}", node_id, node.tag(), err);
            NodeOutput::default()
        }
    }
}
