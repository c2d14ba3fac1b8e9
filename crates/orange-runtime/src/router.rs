//! Message router between contexts.
//!
//! Each request runs in its own task so a panicking handler is reported
//! back as an error response instead of taking the router down. Responses
//! to concurrent requests complete in whatever order the handlers finish.

use crate::message::{MessageType, Request, Response, Target};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Transport-level failures. Everything else is an error *response*.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The extension was reloaded or shut down under the caller
    #[error("Extension context invalidated")]
    ContextInvalidated,
}

/// Receiving side of a context
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, kind: MessageType, data: Value) -> Response;
}

/// Sending side, as seen by the page
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, RouterError>;
}

struct RouterInner {
    handlers: RwLock<HashMap<Target, Arc<dyn MessageHandler>>>,
    invalidated: AtomicBool,
    requests: AtomicU64,
}

/// Routes requests to the handler registered for their target
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

/// Non-owning router handle for components the router itself owns
#[derive(Clone)]
pub struct WeakRouter {
    inner: Weak<RouterInner>,
}

impl WeakRouter {
    pub fn upgrade(&self) -> Option<MessageRouter> {
        self.inner.upgrade().map(|inner| MessageRouter { inner })
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: RwLock::new(HashMap::new()),
                invalidated: AtomicBool::new(false),
                requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler, replacing any previous one for `target`.
    pub fn register(&self, target: Target, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().insert(target, handler);
        debug!("Registered handler for {}", target);
    }

    /// Register only if no handler exists yet. Returns whether it was added.
    pub fn register_if_absent(&self, target: Target, handler: Arc<dyn MessageHandler>) -> bool {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&target) {
            return false;
        }
        handlers.insert(target, handler);
        debug!("Registered handler for {}", target);
        true
    }

    pub fn unregister(&self, target: Target) -> bool {
        let removed = self.inner.handlers.write().remove(&target).is_some();
        if removed {
            debug!("Unregistered handler for {}", target);
        }
        removed
    }

    pub fn is_registered(&self, target: Target) -> bool {
        self.inner.handlers.read().contains_key(&target)
    }

    /// Fail every later send with `ContextInvalidated`.
    pub fn invalidate(&self) {
        if !self.inner.invalidated.swap(true, Ordering::SeqCst) {
            info!("Message router invalidated");
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::SeqCst)
    }

    /// Requests routed so far.
    pub fn request_count(&self) -> u64 {
        self.inner.requests.load(Ordering::Relaxed)
    }

    /// Typed send.
    pub async fn send_to(
        &self,
        target: Target,
        kind: MessageType,
        data: Value,
    ) -> Result<Response, RouterError> {
        if self.is_invalidated() {
            return Err(RouterError::ContextInvalidated);
        }
        self.inner.requests.fetch_add(1, Ordering::Relaxed);

        let handler = self.inner.handlers.read().get(&target).cloned();
        let Some(handler) = handler else {
            debug!("No receiver for {} ({})", target, kind);
            return Ok(Response::error("Receiving end does not exist"));
        };

        trace!("Routing {} to {}", kind, target);
        let task = tokio::spawn(async move { handler.handle(kind, data).await });

        match task.await {
            Ok(response) => Ok(response),
            Err(join_error) if join_error.is_panic() => {
                let panic_info = join_error.into_panic();
                let error_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("Handler for {} panicked on {}: {}", target, kind, error_msg);
                Ok(Response::error(format!("Handler panicked: {}", error_msg)))
            }
            Err(_) => Err(RouterError::ContextInvalidated),
        }
    }

    /// Wire-level send: unknown target or type yields an error response.
    pub async fn dispatch(&self, request: Request) -> Result<Response, RouterError> {
        if self.is_invalidated() {
            return Err(RouterError::ContextInvalidated);
        }
        let Some(target) = Target::parse(&request.target) else {
            return Ok(Response::error(format!("Unknown target: {}", request.target)));
        };
        let Some(kind) = MessageType::parse(&request.kind) else {
            return Ok(Response::error(format!("Unknown message type: {}", request.kind)));
        };
        self.send_to(target, kind, request.data).await
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSender for MessageRouter {
    async fn send(&self, request: Request) -> Result<Response, RouterError> {
        self.dispatch(request).await
    }
}

#[async_trait]
impl MessageSender for WeakRouter {
    async fn send(&self, request: Request) -> Result<Response, RouterError> {
        match self.upgrade() {
            Some(router) => router.dispatch(request).await,
            None => Err(RouterError::ContextInvalidated),
        }
    }
}
