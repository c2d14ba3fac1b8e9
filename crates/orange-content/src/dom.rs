//! In-memory document model
//!
//! An arena of element and text nodes with the parts of the DOM the filter
//! touches: attributes, inline style, rendered size, image pixels, click /
//! context-menu listeners and child-list mutation notifications.

use image::RgbaImage;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to a node in a [`Document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Document shared between the scanner and the dispatch workers
pub type SharedDocument = Arc<Mutex<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Click,
    ContextMenu,
}

/// Event callback. Events target a single node and do not bubble.
pub type Listener = Arc<dyn Fn(&mut Document, NodeId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Children added or removed
    ChildList,
    /// Text node content changed
    CharacterData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
}

/// Decoded image attached to an `<img>`
#[derive(Debug, Clone)]
pub struct ImageData {
    pub natural_width: u32,
    pub natural_height: u32,
    /// Decoded pixels, if the image has loaded
    pub pixels: Option<RgbaImage>,
    /// False for cross-origin images whose pixels may not be read back
    pub origin_clean: bool,
}

impl ImageData {
    pub fn loaded(pixels: RgbaImage) -> Self {
        Self {
            natural_width: pixels.width(),
            natural_height: pixels.height(),
            pixels: Some(pixels),
            origin_clean: true,
        }
    }

    pub fn cross_origin(pixels: RgbaImage) -> Self {
        Self {
            origin_clean: false,
            ..Self::loaded(pixels)
        }
    }
}

struct ListenerEntry {
    kind: EventKind,
    group: &'static str,
    listener: Listener,
}

struct Element {
    tag: String,
    attrs: Vec<(String, String)>,
    style: Vec<(String, String)>,
    layout: Option<(f32, f32)>,
    image: Option<ImageData>,
    listeners: Vec<ListenerEntry>,
}

enum NodeData {
    Element(Element),
    Text(String),
}

struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "div", "dl", "figcaption", "figure", "footer",
    "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "li", "main", "nav", "ol", "p", "section",
    "table", "tr", "ul",
];

pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    hostname: String,
    observers: Vec<mpsc::UnboundedSender<MutationRecord>>,
}

impl Document {
    /// Empty `<html><body></body></html>` document served from `hostname`.
    pub fn new(hostname: impl Into<String>) -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
            hostname: hostname.into(),
            observers: Vec::new(),
        };
        doc.root = doc.create_element("html");
        doc.body = doc.create_element("body");
        doc.nodes[doc.body.0].parent = Some(doc.root);
        doc.nodes[doc.root.0].children.push(doc.body);
        doc
    }

    pub fn into_shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    // ---- construction ----

    /// New detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeData::Element(Element {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            style: Vec::new(),
            layout: None,
            image: None,
            listeners: Vec::new(),
        }))
    }

    /// New detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            data,
        });
        id
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        self.notify(MutationKind::ChildList, parent);
    }

    /// Insert `child` before `reference`; appends when `reference` is not a
    /// child of `parent`.
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: NodeId) {
        self.detach(child);
        let children = &mut self.nodes[parent.0].children;
        match children.iter().position(|&c| c == reference) {
            Some(pos) => children.insert(pos, child),
            None => children.push(child),
        }
        self.nodes[child.0].parent = Some(parent);
        self.notify(MutationKind::ChildList, parent);
    }

    /// Detach `node` from its parent.
    pub fn remove(&mut self, node: NodeId) {
        if let Some(parent) = self.detach(node) {
            self.notify(MutationKind::ChildList, parent);
        }
    }

    fn detach(&mut self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes[node.0].parent.take()?;
        self.nodes[parent.0].children.retain(|&c| c != node);
        Some(parent)
    }

    /// Create an element with attributes and append it to `parent`.
    pub fn append_element(&mut self, parent: NodeId, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let id = self.create_element(tag);
        for (name, value) in attrs {
            self.set_attr(id, name, value);
        }
        self.append_child(parent, id);
        id
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        let id = self.create_text(text);
        self.append_child(parent, id);
        id
    }

    /// Replace a text node's content.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let NodeData::Text(content) = &mut self.nodes[node.0].data {
            *content = text.to_string();
            self.notify(MutationKind::CharacterData, node);
        }
    }

    // ---- tree ----

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0)?.parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes.get(node.0).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(node), move |&n| self.parent(n))
    }

    /// Descendants in document order, excluding `node`.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    /// Still attached to the document tree.
    pub fn is_connected(&self, node: NodeId) -> bool {
        node == self.root || self.ancestors(node).any(|a| a == self.root)
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node.0).map(|n| &n.data), Some(NodeData::Element(_)))
    }

    fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes.get(node.0)?.data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(node.0)?.data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    /// Lowercase tag name.
    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|el| el.tag.as_str())
    }

    // ---- attributes ----

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)?
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, node: NodeId, name: &str) -> bool {
        self.attr(node, name).is_some()
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        let Some(el) = self.element_mut(node) else { return };
        match el.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => el.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) {
        if let Some(el) = self.element_mut(node) {
            el.attrs.retain(|(k, _)| k != name);
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attr(node, "class")
            .is_some_and(|classes| classes.split_ascii_whitespace().any(|c| c == class))
    }

    // ---- style and layout ----

    pub fn style(&self, node: NodeId, property: &str) -> Option<&str> {
        self.element(node)?
            .style
            .iter()
            .find(|(k, _)| k == property)
            .map(|(_, v)| v.as_str())
    }

    /// Set an inline style property. An empty value clears it.
    pub fn set_style(&mut self, node: NodeId, property: &str, value: &str) {
        let Some(el) = self.element_mut(node) else { return };
        el.style.retain(|(k, _)| k != property);
        if !value.is_empty() {
            el.style.push((property.to_string(), value.to_string()));
        }
    }

    /// Record the rendered box size in CSS pixels.
    pub fn set_layout(&mut self, node: NodeId, width: f32, height: f32) {
        if let Some(el) = self.element_mut(node) {
            el.layout = Some((width, height));
        }
    }

    /// Rendered box size, `(0, 0)` when not laid out or not rendered.
    pub fn rendered_size(&self, node: NodeId) -> (f32, f32) {
        if !self.is_rendered(node) {
            return (0.0, 0.0);
        }
        self.element(node).and_then(|el| el.layout).unwrap_or((0.0, 0.0))
    }

    /// Neither the node nor an ancestor has `display: none`.
    pub fn is_rendered(&self, node: NodeId) -> bool {
        std::iter::once(node)
            .chain(self.ancestors(node))
            .all(|n| self.style(n, "display") != Some("none"))
    }

    // ---- images ----

    pub fn set_image(&mut self, node: NodeId, image: ImageData) {
        if let Some(el) = self.element_mut(node) {
            el.image = Some(image);
        }
    }

    pub fn image(&self, node: NodeId) -> Option<&ImageData> {
        self.element(node)?.image.as_ref()
    }

    /// `currentSrc`, falling back to `src`. Empty values count as absent.
    pub fn image_source(&self, node: NodeId) -> Option<&str> {
        self.attr(node, "currentSrc")
            .filter(|s| !s.is_empty())
            .or_else(|| self.attr(node, "src").filter(|s| !s.is_empty()))
    }

    // ---- text ----

    /// All descendant text, regardless of rendering.
    pub fn text_content(&self, node: NodeId) -> String {
        match &self.nodes[node.0].data {
            NodeData::Text(text) => text.clone(),
            NodeData::Element(_) => self
                .descendants(node)
                .into_iter()
                .filter_map(|n| match &self.nodes[n.0].data {
                    NodeData::Text(text) => Some(text.as_str()),
                    NodeData::Element(_) => None,
                })
                .collect(),
        }
    }

    /// Rendered text: skips `display: none` subtrees and separates block
    /// elements. Unrendered nodes fall back to [`Self::text_content`].
    pub fn inner_text(&self, node: NodeId) -> String {
        if !self.is_rendered(node) {
            return self.text_content(node);
        }
        let mut out = String::new();
        self.collect_rendered_text(node, &mut out);
        out.trim().to_string()
    }

    fn collect_rendered_text(&self, node: NodeId, out: &mut String) {
        match &self.nodes[node.0].data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element(el) => {
                if el.style.iter().any(|(k, v)| k == "display" && v == "none") {
                    return;
                }
                let block = BLOCK_TAGS.contains(&el.tag.as_str());
                if block && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                for &child in &self.nodes[node.0].children {
                    self.collect_rendered_text(child, out);
                }
                if block && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }

    // ---- events ----

    /// Add a listener. `group` names the listener set for later removal.
    pub fn add_event_listener(&mut self, node: NodeId, kind: EventKind, group: &'static str, listener: Listener) {
        if let Some(el) = self.element_mut(node) {
            el.listeners.push(ListenerEntry { kind, group, listener });
        }
    }

    pub fn remove_event_listeners(&mut self, node: NodeId, group: &'static str) {
        if let Some(el) = self.element_mut(node) {
            el.listeners.retain(|l| l.group != group);
        }
    }

    pub fn listener_count(&self, node: NodeId) -> usize {
        self.element(node).map(|el| el.listeners.len()).unwrap_or(0)
    }

    /// Fire `kind` at `node`. Returns whether any listener ran.
    pub fn dispatch_event(&mut self, node: NodeId, kind: EventKind) -> bool {
        let listeners: Vec<Listener> = match self.element(node) {
            Some(el) => el
                .listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| l.listener.clone())
                .collect(),
            None => return false,
        };
        for listener in &listeners {
            listener(self, node);
        }
        !listeners.is_empty()
    }

    // ---- mutation observers ----

    /// Subscribe to child-list and character-data mutations anywhere in
    /// the document. Dropping the receiver disconnects.
    pub fn observe(&mut self) -> mpsc::UnboundedReceiver<MutationRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Live observers.
    pub fn observer_count(&self) -> usize {
        self.observers.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn notify(&mut self, kind: MutationKind, target: NodeId) {
        if self.observers.is_empty() {
            return;
        }
        let record = MutationRecord { kind, target };
        self.observers.retain(|tx| tx.send(record).is_ok());
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("hostname", &self.hostname)
            .field("nodes", &self.nodes.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
