use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the GenICam input node.
///
/// Construction failures are split into configuration problems (the GenTL
/// search path) and driver problems (producers that do not load or cannot
/// enumerate devices). Per-tick acquisition failures keep timeouts apart from
/// other driver errors so the host can tell a stalled camera from a broken one.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("driver load error: {0}")]
    DriverLoad(String),
    #[error("no camera at index {index} ({available} available)")]
    DeviceNotFound { index: usize, available: usize },
    #[error("acquisition timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    #[error("unsupported pixel format 0x{0:08x}")]
    UnsupportedPixelFormat(u32),
    #[error("editor error: {0}")]
    Editor(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    /// True for the error kinds raised while a camera is streaming.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_) | NodeError::Acquisition(_) | NodeError::UnsupportedPixelFormat(_)
        )
    }
}
