//! Per-element scan marks, stored as data attributes so they survive
//! rescans and are visible to page tooling.

use crate::dom::{Document, NodeId};

pub const HIDDEN_ATTR: &str = "data-orange-filter-hidden";
pub const REVEALED_ATTR: &str = "data-orange-filter-revealed";
pub const SCANNING_ATTR: &str = "data-orange-filter-scanning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMark {
    Unmarked,
    Hidden,
    /// User override. Never rescanned.
    Revealed,
    Scanning,
}

pub fn scan_mark(doc: &Document, node: NodeId) -> ScanMark {
    if is_revealed(doc, node) {
        ScanMark::Revealed
    } else if is_hidden(doc, node) {
        ScanMark::Hidden
    } else if is_scanning(doc, node) {
        ScanMark::Scanning
    } else {
        ScanMark::Unmarked
    }
}

pub fn is_hidden(doc: &Document, node: NodeId) -> bool {
    doc.attr(node, HIDDEN_ATTR) == Some("true")
}

pub fn is_revealed(doc: &Document, node: NodeId) -> bool {
    doc.attr(node, REVEALED_ATTR) == Some("true")
}

pub fn is_scanning(doc: &Document, node: NodeId) -> bool {
    doc.has_attr(node, SCANNING_ATTR)
}

/// Hidden or revealed: already decided, skip on rescan.
pub fn is_settled(doc: &Document, node: NodeId) -> bool {
    is_hidden(doc, node) || is_revealed(doc, node)
}

/// Some ancestor was hidden by the filter.
pub fn has_hidden_ancestor(doc: &Document, node: NodeId) -> bool {
    doc.ancestors(node).any(|a| is_hidden(doc, a))
}

pub fn mark_hidden(doc: &mut Document, node: NodeId) {
    doc.set_attr(node, HIDDEN_ATTR, "true");
}

pub fn mark_revealed(doc: &mut Document, node: NodeId) {
    doc.set_attr(node, HIDDEN_ATTR, "false");
    doc.set_attr(node, REVEALED_ATTR, "true");
}

pub fn mark_scanning(doc: &mut Document, node: NodeId) {
    doc.set_attr(node, SCANNING_ATTR, "true");
}

pub fn clear_scanning(doc: &mut Document, node: NodeId) {
    doc.remove_attr(node, SCANNING_ATTR);
}
