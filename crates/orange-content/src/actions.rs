//! Hide, blur and reveal actions applied to matched elements.

use crate::dom::{Document, EventKind, NodeId};
use crate::marks;
use orange_config::BlockCounter;
use std::sync::Arc;
use tracing::info;

pub const PLACEHOLDER_CLASS: &str = "orange-filter-placeholder";
pub const PLACEHOLDER_LABEL: &str = "Filtered Content (Click to show)";
pub const REPORT_LABEL: &str = "Report False Positive";

/// Used when an image has no known height
const FALLBACK_HEIGHT: &str = "150px";

const BLUR_LISTENERS: &str = "orange-filter-blur";
const PLACEHOLDER_LISTENERS: &str = "orange-filter-placeholder";

/// Applies filter actions and counts them
#[derive(Debug, Clone)]
pub struct FilterActions {
    counter: BlockCounter,
}

impl FilterActions {
    pub fn new(counter: BlockCounter) -> Self {
        Self { counter }
    }

    pub fn counter(&self) -> &BlockCounter {
        &self.counter
    }

    /// Hide `node`. Images are swapped for a click-to-reveal placeholder.
    ///
    /// Returns false if the node was already hidden or revealed.
    pub fn hide(&self, doc: &mut Document, node: NodeId, reason: &str) -> bool {
        if marks::is_settled(doc, node) {
            return false;
        }
        if doc.tag(node) == Some("img") {
            if let Some(parent) = doc.parent(node) {
                let placeholder = create_placeholder(doc, node, reason);
                doc.insert_before(parent, placeholder, node);
            }
        }
        doc.set_style(node, "display", "none");
        marks::mark_hidden(doc, node);

        info!("Hidden element ({})", reason);
        self.counter.increment();
        true
    }

    /// Blur `node` in place. Click reveals; right-click reports and reveals.
    pub fn blur(&self, doc: &mut Document, node: NodeId, reason: &str) -> bool {
        if marks::is_settled(doc, node) {
            return false;
        }
        doc.set_style(node, "filter", "blur(20px)");
        doc.set_style(node, "cursor", "pointer");
        doc.set_attr(
            node,
            "title",
            &format!("Filtered: {} (Click to show / Right-click to report)", reason),
        );
        marks::mark_hidden(doc, node);

        doc.add_event_listener(
            node,
            EventKind::Click,
            BLUR_LISTENERS,
            Arc::new(|doc: &mut Document, node: NodeId| unblur(doc, node)),
        );
        doc.add_event_listener(
            node,
            EventKind::ContextMenu,
            BLUR_LISTENERS,
            Arc::new(|doc: &mut Document, node: NodeId| {
                report_false_positive(doc, node);
                unblur(doc, node);
            }),
        );

        info!("Blurred element ({})", reason);
        self.counter.increment();
        true
    }
}

fn unblur(doc: &mut Document, node: NodeId) {
    doc.set_style(node, "filter", "");
    doc.set_style(node, "cursor", "");
    doc.remove_attr(node, "title");
    doc.remove_event_listeners(node, BLUR_LISTENERS);
    marks::mark_revealed(doc, node);
}

/// Log a user report that `node` was filtered wrongly.
pub fn report_false_positive(doc: &Document, node: NodeId) {
    let source = doc.image_source(node).unwrap_or("<no source>");
    info!("False positive reported - {}", source);
}

fn px(value: f32) -> String {
    format!("{}px", value.round() as i64)
}

fn create_placeholder(doc: &mut Document, img: NodeId, reason: &str) -> NodeId {
    let (rendered_w, rendered_h) = doc.rendered_size(img);
    let (natural_w, natural_h) = doc
        .image(img)
        .map(|i| (i.natural_width as f32, i.natural_height as f32))
        .unwrap_or((0.0, 0.0));
    let width = if natural_w > 0.0 { natural_w } else { rendered_w };
    let height = if natural_h > 0.0 { natural_h } else { rendered_h };

    let placeholder = doc.create_element("div");
    doc.set_attr(placeholder, "class", PLACEHOLDER_CLASS);
    doc.set_attr(placeholder, "title", &format!("Filtered: {}", reason));

    let css_width = if rendered_w > 0.0 {
        px(rendered_w)
    } else if width > 0.0 {
        px(width)
    } else {
        "100%".to_string()
    };
    doc.set_style(placeholder, "width", &css_width);
    if width > 0.0 && height > 0.0 {
        doc.set_style(placeholder, "aspect-ratio", &format!("{} / {}", width.round(), height.round()));
        doc.set_style(placeholder, "height", "auto");
    } else if rendered_h > 0.0 {
        doc.set_style(placeholder, "height", &px(rendered_h));
    } else {
        doc.set_style(placeholder, "height", FALLBACK_HEIGHT);
    }
    doc.set_style(placeholder, "display", "flex");
    doc.set_style(placeholder, "flex-direction", "column");
    doc.set_style(placeholder, "align-items", "center");
    doc.set_style(placeholder, "justify-content", "center");
    doc.set_style(placeholder, "cursor", "pointer");
    doc.set_style(placeholder, "background-color", "#f4f4f4");
    doc.set_style(placeholder, "border", "1px solid #ddd");
    doc.set_style(placeholder, "color", "#888");
    doc.set_style(placeholder, "font-size", "11px");

    let label = doc.append_element(placeholder, "div", &[]);
    doc.append_text(label, PLACEHOLDER_LABEL);

    let report = doc.append_element(placeholder, "div", &[]);
    doc.append_text(report, REPORT_LABEL);
    doc.set_style(report, "font-size", "9px");
    doc.set_style(report, "text-decoration", "underline");

    doc.add_event_listener(
        placeholder,
        EventKind::Click,
        PLACEHOLDER_LISTENERS,
        Arc::new(move |doc: &mut Document, placeholder: NodeId| {
            doc.remove(placeholder);
            doc.set_style(img, "display", "");
            marks::mark_revealed(doc, img);
        }),
    );
    doc.add_event_listener(
        report,
        EventKind::Click,
        PLACEHOLDER_LISTENERS,
        Arc::new(move |doc: &mut Document, _report: NodeId| {
            report_false_positive(doc, img);
            doc.dispatch_event(placeholder, EventKind::Click);
        }),
    );

    placeholder
}

/// Placeholder inserted in front of a hidden image, if any.
pub fn placeholder_for(doc: &Document, img: NodeId) -> Option<NodeId> {
    let parent = doc.parent(img)?;
    let siblings = doc.children(parent);
    let pos = siblings.iter().position(|&c| c == img)?;
    let prev = *siblings.get(pos.checked_sub(1)?)?;
    doc.has_class(prev, PLACEHOLDER_CLASS).then_some(prev)
}
