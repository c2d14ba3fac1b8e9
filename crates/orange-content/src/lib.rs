//! Orange Filter Content
//!
//! Page-side filtering over an in-memory document model:
//! - Keyword scanning of content containers and image context
//! - Hide, blur and placeholder actions with click-to-reveal
//! - Bounded dispatch of candidate images to the background classifier
//! - Debounced rescans driven by document mutations

pub mod dom;
pub mod selector;
pub mod marks;
mod matcher;
mod actions;
mod scanner;
mod ai_queue;
mod debounce;
mod page;

pub use dom::{Document, EventKind, ImageData, MutationKind, MutationRecord, NodeId, SharedDocument};
pub use selector::{Selector, SelectorError};
pub use matcher::KeywordMatcher;
pub use actions::{placeholder_for, report_false_positive, FilterActions, PLACEHOLDER_CLASS};
pub use scanner::{
    image_context, ScanReport, Scanner, ScannerOptions, DEFAULT_CONTAINER_SELECTORS,
    DEFAULT_EXTRA_KEYWORDS, DEFAULT_MAIN_CONTENT_SELECTORS,
};
pub use ai_queue::{AiDispatcher, DispatchConfig, DispatchHandle, HttpImageFetcher, ImageFetcher};
pub use debounce::Debouncer;
pub use page::{PageFilter, PageOptions, PageState};
