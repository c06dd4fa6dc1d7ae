//! GenICam camera input node.
//!
//! The node owns a device registry for its whole lifetime and at most one open
//! camera. The camera follows the selector: the first tick with a selection
//! opens it, a different selection closes it and opens the new one, an empty
//! selection closes it. Every tick with an open camera runs exactly one
//! start / fetch / stop cycle bounded by the configured timeout.

use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::{GenTlPath, SharedConfig};
use crate::demosaic;
use crate::editor::{Attribute, AttributeKind, NodeEditor, NodeLayout, NodeTags, SocketType, Widget};
use crate::gentl::{Camera, DeviceRegistry};
use crate::texture::{DisplayTexture, SharedTexture};
use crate::NodeError;

use super::{Connection, ImageMap, Node, NodeOutput, NodeSettings, ResultMap};

pub const NODE_LABEL: &str = "GenICam";
pub const NODE_TAG: &str = "GenICam";
pub const NODE_VERSION: &str = "0.0.1";

const SELECTOR_SLOT: &str = "Input01";
const IMAGE_SLOT: &str = "Output01";
const LATENCY_SLOT: &str = "Output02";
const LATENCY_PLACEHOLDER: &str = "elapsed time(ms)";
const SELECTOR_LABEL: &str = "Device No";
const SELECTOR_MARGIN: u32 = 100;

pub struct GenICamInputNode {
    camera: Option<Camera>,
    registry: Option<DeviceRegistry>,
    config: Option<SharedConfig>,
    texture: Option<SharedTexture>,
}

impl GenICamInputNode {
    /// Loads the producers listed in `GENICAM_GENTL64_PATH`.
    pub fn new() -> Result<Self, NodeError> {
        Self::with_gentl_path(&GenTlPath::from_env()?)
    }

    pub fn with_gentl_path(path: &GenTlPath) -> Result<Self, NodeError> {
        let registry = DeviceRegistry::open(path)?;
        Ok(Self::with_registry(registry))
    }

    pub fn with_registry(registry: DeviceRegistry) -> Self {
        Self {
            camera: None,
            registry: Some(registry),
            config: None,
            texture: None,
        }
    }

    pub fn registry(&self) -> Option<&DeviceRegistry> {
        self.registry.as_ref()
    }

    /// Index of the open camera, if any.
    pub fn open_camera(&self) -> Option<usize> {
        self.camera.as_ref().map(Camera::index)
    }

    pub fn texture(&self) -> Option<SharedTexture> {
        self.texture.as_ref().map(Rc::clone)
    }

    fn selector_items(&self, config: &SharedConfig) -> Vec<String> {
        if !config.device_no_list.is_empty() {
            return config.device_no_list.iter().map(usize::to_string).collect();
        }
        self.registry
            .iter()
            .flat_map(|registry| registry.devices())
            .map(|info| info.index.to_string())
            .collect()
    }

    /// Brings the open camera in line with the selector.
    fn sync_camera(&mut self, selected: Option<usize>) -> Result<(), NodeError> {
        if self.open_camera() == selected {
            return Ok(());
        }
        self.close_camera();
        let (Some(index), Some(registry)) = (selected, self.registry.as_ref()) else {
            return Ok(());
        };
        let camera = registry.create(index)?;
        log::info!(
            "{}: opened camera {} ({} {})",
            NODE_TAG,
            index,
            camera.info().vendor,
            camera.info().model
        );
        self.camera = Some(camera);
        Ok(())
    }

    fn close_camera(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(err) = camera.stop() {
                log::warn!("{}: stopping camera {} failed: {}", NODE_TAG, camera.index(), err);
            }
        }
    }
}

fn selected_index(editor: &dyn NodeEditor, tags: &NodeTags) -> Option<usize> {
    editor
        .value(&tags.value(SocketType::Int, SELECTOR_SLOT))
        .and_then(|value| value.trim().parse().ok())
}

const MAX_LATENCY_MS: u128 = 9_999;

/// Latency text: four zero-padded digits, e.g. `0007ms`. Saturates at `9999ms`.
pub(crate) fn format_latency(elapsed: Duration) -> String {
    format!("{:04}ms", elapsed.as_millis().min(MAX_LATENCY_MS))
}

impl Node for GenICamInputNode {
    fn label(&self) -> &'static str {
        NODE_LABEL
    }

    fn tag(&self) -> &'static str {
        NODE_TAG
    }

    fn build(
        &mut self,
        editor: &mut dyn NodeEditor,
        parent: &str,
        node_id: u32,
        pos: [f32; 2],
        config: &SharedConfig,
    ) -> Result<String, NodeError> {
        let tags = NodeTags::new(node_id, NODE_TAG);
        let texture_tag = tags.value(SocketType::Image, IMAGE_SLOT);
        let texture = DisplayTexture::shared(config.display_width, config.display_height);
        editor.add_raw_texture(&texture_tag, Rc::clone(&texture))?;

        let mut attributes = vec![
            Attribute {
                tag: tags.attribute(SocketType::Int, SELECTOR_SLOT),
                kind: AttributeKind::Static,
                widget: Widget::Combo {
                    tag: tags.value(SocketType::Int, SELECTOR_SLOT),
                    label: SELECTOR_LABEL.to_string(),
                    items: self.selector_items(config),
                    width: config.display_width.saturating_sub(SELECTOR_MARGIN),
                },
            },
            Attribute {
                tag: tags.attribute(SocketType::Image, IMAGE_SLOT),
                kind: AttributeKind::Output,
                widget: Widget::Image {
                    texture: texture_tag,
                },
            },
        ];
        if config.use_pref_counter {
            attributes.push(Attribute {
                tag: tags.attribute(SocketType::TimeMs, LATENCY_SLOT),
                kind: AttributeKind::Output,
                widget: Widget::Text {
                    tag: tags.value(SocketType::TimeMs, LATENCY_SLOT),
                    default_value: LATENCY_PLACEHOLDER.to_string(),
                },
            });
        }

        editor.add_node(NodeLayout {
            tag: tags.node.clone(),
            parent: parent.to_string(),
            label: NODE_LABEL.to_string(),
            pos,
            attributes,
        })?;

        self.texture = Some(texture);
        self.config = Some(config.clone());
        log::debug!(
            "{}: built {} ({}x{} texture)",
            NODE_TAG,
            tags.node,
            config.display_width,
            config.display_height
        );
        Ok(tags.node)
    }

    fn evaluate(
        &mut self,
        editor: &mut dyn NodeEditor,
        node_id: u32,
        _connections: &[Connection],
        _images: &ImageMap,
        _results: &ResultMap,
    ) -> Result<NodeOutput, NodeError> {
        let Some((use_pref_counter, timeout)) = self
            .config
            .as_ref()
            .map(|config| (config.use_pref_counter, config.acquisition_timeout))
        else {
            return Ok(NodeOutput::default());
        };
        let tags = NodeTags::new(node_id, NODE_TAG);
        self.sync_camera(selected_index(editor, &tags))?;

        let started = use_pref_counter.then(Instant::now);

        let mut frame = None;
        if let Some(camera) = self.camera.as_mut() {
            let raw = camera.acquire_one(timeout)?;
            frame = Some(demosaic::to_rgb(&raw)?);
        }

        if let (Some(started), Some(_)) = (started, frame.as_ref()) {
            editor.set_value(
                &tags.value(SocketType::TimeMs, LATENCY_SLOT),
                &format_latency(started.elapsed()),
            )?;
        }

        if let (Some(image), Some(texture)) = (frame.as_ref(), self.texture.as_ref()) {
            texture.borrow_mut().write_rgb(image);
        }

        Ok(NodeOutput {
            image: frame,
            result: None,
        })
    }

    fn close(&mut self, node_id: u32) -> Result<(), NodeError> {
        self.close_camera();
        if let Some(mut registry) = self.registry.take() {
            registry.reset();
            log::info!("{}:{} closed, GenTL resources released", node_id, NODE_TAG);
        }
        Ok(())
    }

    fn settings(&self, editor: &dyn NodeEditor, node_id: u32) -> Result<NodeSettings, NodeError> {
        let tags = NodeTags::new(node_id, NODE_TAG);
        let pos = editor
            .item_pos(&tags.node)
            .ok_or_else(|| NodeError::Editor(format!("node '{}' is not built", tags.node)))?;
        Ok(NodeSettings {
            ver: NODE_VERSION.to_string(),
            pos,
        })
    }

    fn set_settings(&mut self, node_id: u32, settings: &serde_json::Value) {
        // Nothing beyond the position is persisted, and the host restores
        // positions itself.
        log::debug!("{}:{} settings restore ignored: {}", node_id, NODE_TAG, settings);
    }
}

impl Drop for GenICamInputNode {
    fn drop(&mut self) {
        self.close_camera();
    }
}
