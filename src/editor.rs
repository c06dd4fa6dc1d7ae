//! Host editor contract.
//!
//! Nodes never talk to a GUI toolkit directly. They describe their layout as a
//! `NodeLayout`, register textures, and read/write widget values by tag through
//! `NodeEditor`. `HeadlessEditor` is the in-memory implementation used by the
//! runner binary and by tests.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::texture::SharedTexture;
use crate::NodeError;

/// Socket data types, as they appear in item tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Int,
    Image,
    TimeMs,
}

impl SocketType {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketType::Int => "Int",
            SocketType::Image => "Image",
            SocketType::TimeMs => "TimeMS",
        }
    }
}

/// Item tags of one node instance: `"{id}:{node}"` for the node and
/// `"{id}:{node}:{type}:{slot}"` for its attributes and their widgets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTags {
    pub node: String,
}

impl NodeTags {
    pub fn new(node_id: u32, node_tag: &str) -> Self {
        Self {
            node: format!("{node_id}:{node_tag}"),
        }
    }

    pub fn attribute(&self, socket: SocketType, slot: &str) -> String {
        format!("{}:{}:{}", self.node, socket.as_str(), slot)
    }

    pub fn value(&self, socket: SocketType, slot: &str) -> String {
        format!("{}:{}:{}Value", self.node, socket.as_str(), slot)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Static,
    Input,
    Output,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Widget {
    /// Selection box; its value is the selected item, or empty.
    Combo {
        tag: String,
        label: String,
        items: Vec<String>,
        width: u32,
    },
    /// Displays a registered texture.
    Image { texture: String },
    Text { tag: String, default_value: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub tag: String,
    pub kind: AttributeKind,
    pub widget: Widget,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeLayout {
    pub tag: String,
    pub parent: String,
    pub label: String,
    pub pos: [f32; 2],
    pub attributes: Vec<Attribute>,
}

pub trait NodeEditor {
    /// Registers a texture under `tag`; the editor keeps a shared handle.
    fn add_raw_texture(&mut self, tag: &str, texture: SharedTexture) -> Result<(), NodeError>;

    fn add_node(&mut self, layout: NodeLayout) -> Result<(), NodeError>;

    /// Current value of a widget, `None` for unknown tags.
    fn value(&self, tag: &str) -> Option<String>;

    fn set_value(&mut self, tag: &str, value: &str) -> Result<(), NodeError>;

    fn item_pos(&self, tag: &str) -> Option<[f32; 2]>;

    fn set_item_pos(&mut self, tag: &str, pos: [f32; 2]) -> Result<(), NodeError>;

    /// Removes a node with its widgets and the textures they display.
    fn remove_node(&mut self, tag: &str);
}

/// In-memory editor. Rejects duplicate tags instead of shadowing items.
#[derive(Default)]
pub struct HeadlessEditor {
    nodes: BTreeMap<String, NodeLayout>,
    values: HashMap<String, String>,
    positions: HashMap<String, [f32; 2]>,
    textures: HashMap<String, SharedTexture>,
}

impl HeadlessEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texture(&self, tag: &str) -> Option<SharedTexture> {
        self.textures.get(tag).map(Rc::clone)
    }

    pub fn node(&self, tag: &str) -> Option<&NodeLayout> {
        self.nodes.get(tag)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Items offered by the combo widget `tag`.
    pub fn combo_items(&self, tag: &str) -> Option<&[String]> {
        self.nodes
            .values()
            .flat_map(|node| node.attributes.iter())
            .find_map(|attribute| match &attribute.widget {
                Widget::Combo { tag: combo, items, .. } if combo == tag => Some(items.as_slice()),
                _ => None,
            })
    }

    fn is_taken(&self, tag: &str) -> bool {
        self.nodes.contains_key(tag)
            || self.values.contains_key(tag)
            || self
                .nodes
                .values()
                .any(|node| node.attributes.iter().any(|attribute| attribute.tag == tag))
    }
}

impl NodeEditor for HeadlessEditor {
    fn add_raw_texture(&mut self, tag: &str, texture: SharedTexture) -> Result<(), NodeError> {
        if self.textures.contains_key(tag) {
            return Err(NodeError::Editor(format!("texture '{}' already registered", tag)));
        }
        self.textures.insert(tag.to_string(), texture);
        Ok(())
    }

    fn add_node(&mut self, layout: NodeLayout) -> Result<(), NodeError> {
        if self.is_taken(&layout.tag) {
            return Err(NodeError::Editor(format!("item '{}' already exists", layout.tag)));
        }
        let mut values = Vec::new();
        for attribute in &layout.attributes {
            if self.is_taken(&attribute.tag) {
                return Err(NodeError::Editor(format!("item '{}' already exists", attribute.tag)));
            }
            match &attribute.widget {
                Widget::Combo { tag, .. } => values.push((tag.clone(), String::new())),
                Widget::Text { tag, default_value } => values.push((tag.clone(), default_value.clone())),
                Widget::Image { texture } => {
                    if !self.textures.contains_key(texture) {
                        return Err(NodeError::Editor(format!(
                            "image widget refers to unknown texture '{}'",
                            texture
                        )));
                    }
                }
            }
        }
        for (tag, _) in &values {
            if self.is_taken(tag) {
                return Err(NodeError::Editor(format!("item '{}' already exists", tag)));
            }
        }
        self.values.extend(values);
        self.positions.insert(layout.tag.clone(), layout.pos);
        self.nodes.insert(layout.tag.clone(), layout);
        Ok(())
    }

    fn value(&self, tag: &str) -> Option<String> {
        self.values.get(tag).cloned()
    }

    fn set_value(&mut self, tag: &str, value: &str) -> Result<(), NodeError> {
        match self.values.get_mut(tag) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(NodeError::Editor(format!("no widget '{}'", tag))),
        }
    }

    fn item_pos(&self, tag: &str) -> Option<[f32; 2]> {
        self.positions.get(tag).copied()
    }

    fn set_item_pos(&mut self, tag: &str, pos: [f32; 2]) -> Result<(), NodeError> {
        match self.positions.get_mut(tag) {
            Some(slot) => {
                *slot = pos;
                Ok(())
            }
            None => Err(NodeError::Editor(format!("no node '{}'", tag))),
        }
    }

    fn remove_node(&mut self, tag: &str) {
        let Some(layout) = self.nodes.remove(tag) else {
            return;
        };
        self.positions.remove(tag);
        for attribute in layout.attributes {
            match attribute.widget {
                Widget::Combo { tag, .. } | Widget::Text { tag, .. } => {
                    self.values.remove(&tag);
                }
                Widget::Image { texture } => {
                    self.textures.remove(&texture);
                }
            }
        }
    }
}
