//! Orange Filter Runtime
//!
//! Cross-context plumbing between the page, the background and the
//! offscreen worker that hosts the image classifier:
//! - Message routing with per-request panic isolation
//! - Offscreen document lifecycle (lazy create, idle teardown)
//! - Background handler tracking classifier warm-up
//! - Network rule sync on list changes

mod message;
mod payload;
mod router;
mod classifier;
mod offscreen;
mod host;
mod worker;
mod background;
mod rule_sync;
mod context;

pub use message::{
    ClassificationResult, ImagePayload, MessageType, ModelStatus, PayloadKind, Request, Response,
    Target,
};
pub use payload::{decode_data_url, encode_data_url, PayloadError};
pub use router::{MessageHandler, MessageRouter, MessageSender, RouterError, WeakRouter};
pub use classifier::{Classifier, ClassifierError, ClassifierFactory, ClassifierRegistry};
pub use offscreen::{BridgeConfig, BridgeError, BridgeState, HostError, OffscreenBridge, OffscreenHost};
pub use host::InProcessOffscreenHost;
pub use worker::OffscreenHandler;
pub use background::BackgroundHandler;
pub use rule_sync::{spawn_rule_sync, update_rules};
pub use context::ExtensionContext;
