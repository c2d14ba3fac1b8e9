//! Document scanner
//!
//! One pass over the page:
//! 1. Text containers whose rendered text contains a keyword are hidden,
//!    along with their main-content ancestor when that ancestor matches on
//!    its own (skipped entirely in pictures-only mode).
//! 2. Images whose alt / title / link / caption text contains a keyword
//!    are hidden.
//! 3. Remaining images go to the AI queue when a backend is selected and
//!    the user consented.

use crate::actions::FilterActions;
use crate::ai_queue::{AiDispatcher, DispatchHandle};
use crate::dom::{Document, NodeId, SharedDocument};
use crate::marks;
use crate::matcher::KeywordMatcher;
use crate::selector::Selector;
use once_cell::sync::Lazy;
use orange_config::Settings;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Content regions treated as one unit of hide / show
pub const DEFAULT_CONTAINER_SELECTORS: &[&str] = &[
    "article",
    ".card",
    ".teaser",
    ".story",
    ".sidebar",
    ".post",
    ".content-item",
    r#"div[role="article"]"#,
    r#"div[role="listitem"]"#,
    // Search results
    ".g",
    ".b_algo",
    // Video pages
    r#"div[data-pagelet="WatchPermalinkVideo"]"#,
    r#"div[data-pagelet="VideoMetadata"]"#,
    r#"div[data-pagelet="TahoeRightRail"]"#,
    r#"div[data-pagelet="TahoeRightRailRecommendations"]"#,
];

pub const DEFAULT_MAIN_CONTENT_SELECTORS: &[&str] =
    &[r#"[role="main"]"#, "main", ".main-content", r#"[data-testid="article"]"#];

/// Always matched alongside the user's keywords
pub const DEFAULT_EXTRA_KEYWORDS: &[&str] = &[
    "donald trump",
    "president trump",
    "former president trump",
    "trump administration",
    "mar-a-lago",
    "truth social",
];

static DEFAULT_OPTIONS: Lazy<ScannerOptions> = Lazy::new(|| ScannerOptions {
    container_selectors: DEFAULT_CONTAINER_SELECTORS.iter().map(|s| s.to_string()).collect(),
    main_content_selectors: DEFAULT_MAIN_CONTENT_SELECTORS.iter().map(|s| s.to_string()).collect(),
    extra_keywords: DEFAULT_EXTRA_KEYWORDS.iter().map(|s| s.to_string()).collect(),
});

static IMAGE: Lazy<Selector> = Lazy::new(|| parse_builtin("img"));
static LINK: Lazy<Selector> = Lazy::new(|| parse_builtin("a"));
static FIGURE: Lazy<Selector> = Lazy::new(|| parse_builtin("figure"));
static CAPTION: Lazy<Selector> = Lazy::new(|| parse_builtin("figcaption"));

fn parse_builtin(selector: &str) -> Selector {
    let (parsed, _) = Selector::parse_lenient(&[selector]);
    parsed.unwrap_or_else(Selector::never)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOptions {
    pub container_selectors: Vec<String>,
    pub main_content_selectors: Vec<String>,
    pub extra_keywords: Vec<String>,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        DEFAULT_OPTIONS.clone()
    }
}

/// What one pass did
#[derive(Debug, Default)]
pub struct ScanReport {
    pub containers_hidden: usize,
    pub images_hidden: usize,
    pub images_queued: usize,
    /// Workers started for the queued images, if any
    pub dispatch: Option<DispatchHandle>,
}

pub struct Scanner {
    containers: Option<Selector>,
    main_content: Option<Selector>,
    extra_keywords: Vec<String>,
    actions: FilterActions,
    dispatcher: Option<AiDispatcher>,
    passes: AtomicU64,
}

impl Scanner {
    pub fn new(options: ScannerOptions, actions: FilterActions, dispatcher: Option<AiDispatcher>) -> Self {
        let (containers, errors) = Selector::parse_lenient(&options.container_selectors);
        for e in errors {
            warn!("Skipping container selector: {}", e);
        }
        let (main_content, errors) = Selector::parse_lenient(&options.main_content_selectors);
        for e in errors {
            warn!("Skipping main content selector: {}", e);
        }
        Self {
            containers,
            main_content,
            extra_keywords: options.extra_keywords,
            actions,
            dispatcher,
            passes: AtomicU64::new(0),
        }
    }

    pub fn actions(&self) -> &FilterActions {
        &self.actions
    }

    pub fn dispatcher(&self) -> Option<&AiDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Completed scan passes.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Scan the document. Returns once matches are hidden and AI
    /// candidates are queued; classification continues in the background.
    ///
    /// Invalid `extra_selectors` are logged and skipped.
    pub fn scan<S: AsRef<str>>(
        &self,
        doc: &SharedDocument,
        keywords: &[S],
        settings: &Settings,
        extra_selectors: &[S],
    ) -> ScanReport {
        let mut report = ScanReport::default();
        if keywords.iter().all(|k| k.as_ref().trim().is_empty()) {
            return report;
        }
        let matcher = KeywordMatcher::new(
            keywords
                .iter()
                .map(|k| k.as_ref())
                .chain(self.extra_keywords.iter().map(String::as_str)),
        );

        let candidates = {
            let mut doc = doc.lock();
            if settings.sensitivity.filters_text() {
                report.containers_hidden = self.scan_containers(&mut doc, &matcher, extra_selectors);
            }
            let (hidden, candidates) = self.scan_images(&mut doc, &matcher, settings);
            report.images_hidden = hidden;
            candidates
        };

        report.images_queued = candidates.len();
        if !candidates.is_empty() {
            if let Some(dispatcher) = &self.dispatcher {
                report.dispatch = Some(dispatcher.enqueue(candidates, settings.sensitivity));
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Scan pass: {} containers hidden, {} images hidden, {} images queued",
            report.containers_hidden, report.images_hidden, report.images_queued
        );
        report
    }

    fn scan_containers<S: AsRef<str>>(
        &self,
        doc: &mut Document,
        matcher: &KeywordMatcher,
        extra_selectors: &[S],
    ) -> usize {
        let (extra, errors) = Selector::parse_lenient(extra_selectors);
        for e in errors {
            warn!("Skipping extra selector: {}", e);
        }

        let selector = match (&self.containers, &extra) {
            (Some(base), Some(extra)) => base.union(extra),
            (Some(base), None) => base.clone(),
            (None, Some(extra)) => extra.clone(),
            (None, None) => return 0,
        };

        let mut hidden = 0;
        for container in selector.query_all(doc, doc.root()) {
            if marks::is_settled(doc, container) {
                continue;
            }
            if !matcher.is_match(&doc.inner_text(container)) {
                continue;
            }
            if self.actions.hide(doc, container, "Text match") {
                hidden += 1;
            }

            // The parent must match on its own: the hidden container no
            // longer contributes rendered text.
            let main = self
                .main_content
                .as_ref()
                .and_then(|sel| doc.ancestors(container).find(|&a| sel.matches(doc, a)));
            if let Some(main) = main {
                if !marks::is_settled(doc, main)
                    && matcher.is_match(&doc.inner_text(main))
                    && self.actions.hide(doc, main, "Parent container match")
                {
                    hidden += 1;
                }
            }
        }
        hidden
    }

    fn scan_images(
        &self,
        doc: &mut Document,
        matcher: &KeywordMatcher,
        settings: &Settings,
    ) -> (usize, Vec<NodeId>) {
        let mut hidden = 0;
        let mut candidates = Vec::new();

        for img in IMAGE.query_all(doc, doc.root()) {
            if marks::is_settled(doc, img) || marks::has_hidden_ancestor(doc, img) {
                continue;
            }
            if matcher.is_match(&image_context(doc, img)) {
                if self.actions.hide(doc, img, "Image context match") {
                    hidden += 1;
                }
                continue;
            }
            if settings.ai_dispatch_enabled() && !marks::is_scanning(doc, img) {
                candidates.push(img);
            }
        }
        (hidden, candidates)
    }
}

/// Alt, title, enclosing link text and figure caption of an image.
pub fn image_context(doc: &Document, img: NodeId) -> String {
    let mut context = String::new();
    context.push_str(doc.attr(img, "alt").unwrap_or(""));
    context.push(' ');
    context.push_str(doc.attr(img, "title").unwrap_or(""));

    if let Some(link) = LINK.closest(doc, img) {
        context.push(' ');
        context.push_str(&doc.inner_text(link));
    }
    if let Some(caption) = FIGURE.closest(doc, img).and_then(|figure| CAPTION.query(doc, figure)) {
        context.push(' ');
        context.push_str(&doc.inner_text(caption));
    }
    context.trim().to_string()
}
