//! Offscreen document lifecycle
//!
//! The offscreen context loads the classifier, which is expensive, so it is
//! created lazily, kept warm across bursts of requests and torn down after
//! an idle period.
//!
//! ```text
//! Absent ──ensure_ready──▶ Creating ──ok──▶ Ready ──idle timeout──▶ Closing ──▶ Absent
//!                             │                ▲
//!                             └──err──▶ Absent └── ensure_ready cancels the timer
//! ```
//!
//! Creation is single-flight: every caller arriving while `Creating` awaits
//! the same shared operation, so the host never sees two create requests
//! racing each other.

use crate::message::{MessageType, Response, Target};
use crate::router::{RouterError, WeakRouter};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Errors reported by the host that owns offscreen documents
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Only a single offscreen document may be created")]
    AlreadyExists,

    #[error("Offscreen document creation failed: {0}")]
    CreateFailed(String),

    #[error("Offscreen document close failed: {0}")]
    CloseFailed(String),
}

/// Creates and destroys the worker context
#[async_trait]
pub trait OffscreenHost: Send + Sync {
    async fn create_document(&self) -> Result<(), HostError>;

    async fn close_document(&self) -> Result<(), HostError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Absent,
    Creating,
    Ready,
    Closing,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Teardown after this long without a completed round trip
    pub idle_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
        }
    }
}

type SharedOp = Shared<BoxFuture<'static, Result<(), HostError>>>;

enum Phase {
    Absent,
    Creating(SharedOp),
    Ready,
    Closing(SharedOp),
}

struct LifecycleState {
    phase: Phase,
    /// Bumped whenever the idle timer is armed or cancelled
    idle_generation: u64,
    idle_task: Option<AbortHandle>,
}

impl LifecycleState {
    fn cancel_idle_timer(&mut self) {
        if let Some(task) = self.idle_task.take() {
            task.abort();
        }
        self.idle_generation += 1;
    }
}

struct BridgeInner {
    host: Arc<dyn OffscreenHost>,
    router: WeakRouter,
    config: BridgeConfig,
    state: Mutex<LifecycleState>,
    in_flight: AtomicUsize,
    creations: AtomicU64,
}

enum Pending {
    Create(SharedOp),
    Close(SharedOp),
}

/// Decrements the in-flight count even if the request future is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide handle to the offscreen context
#[derive(Clone)]
pub struct OffscreenBridge {
    inner: Arc<BridgeInner>,
}

impl OffscreenBridge {
    pub fn new(host: Arc<dyn OffscreenHost>, router: WeakRouter, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                host,
                router,
                config,
                state: Mutex::new(LifecycleState {
                    phase: Phase::Absent,
                    idle_generation: 0,
                    idle_task: None,
                }),
                in_flight: AtomicUsize::new(0),
                creations: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        match self.inner.state.lock().phase {
            Phase::Absent => BridgeState::Absent,
            Phase::Creating(_) => BridgeState::Creating,
            Phase::Ready => BridgeState::Ready,
            Phase::Closing(_) => BridgeState::Closing,
        }
    }

    /// Create requests issued to the host so far.
    pub fn creation_count(&self) -> u64 {
        self.inner.creations.load(Ordering::Relaxed)
    }

    /// Make sure the offscreen document exists.
    pub async fn ensure_ready(&self) -> Result<(), BridgeError> {
        loop {
            let pending = {
                let mut state = self.inner.state.lock();
                match &state.phase {
                    Phase::Ready => {
                        state.cancel_idle_timer();
                        return Ok(());
                    }
                    Phase::Creating(op) => Pending::Create(op.clone()),
                    Phase::Closing(op) => Pending::Close(op.clone()),
                    Phase::Absent => {
                        let op = self.start_create();
                        state.phase = Phase::Creating(op.clone());
                        Pending::Create(op)
                    }
                }
            };

            match pending {
                Pending::Create(op) => return op.await.map_err(BridgeError::Host),
                // Let the teardown finish, then create afresh
                Pending::Close(op) => {
                    let _ = op.await;
                }
            }
        }
    }

    /// Send a request to the offscreen context, creating it if needed.
    ///
    /// A completed round trip re-arms the idle timer.
    pub async fn send(&self, kind: MessageType, data: Value) -> Result<Response, BridgeError> {
        let response = {
            let _in_flight = InFlight::enter(&self.inner.in_flight);
            self.ensure_ready().await?;
            let router = self
                .inner
                .router
                .upgrade()
                .ok_or(BridgeError::Router(RouterError::ContextInvalidated))?;
            router.send_to(Target::Offscreen, kind, data).await?
        };
        self.arm_idle_timer();
        Ok(response)
    }

    /// Tear the document down now, waiting out any in-progress creation.
    pub async fn close(&self) -> Result<(), BridgeError> {
        loop {
            let pending = {
                let mut state = self.inner.state.lock();
                match &state.phase {
                    Phase::Absent => return Ok(()),
                    Phase::Creating(op) => Pending::Create(op.clone()),
                    Phase::Closing(op) => Pending::Close(op.clone()),
                    Phase::Ready => {
                        state.cancel_idle_timer();
                        let op = self.start_close();
                        state.phase = Phase::Closing(op.clone());
                        Pending::Close(op)
                    }
                }
            };

            match pending {
                Pending::Create(op) => {
                    let _ = op.await;
                }
                Pending::Close(op) => return op.await.map_err(BridgeError::Host),
            }
        }
    }

    fn start_create(&self) -> SharedOp {
        self.inner.creations.fetch_add(1, Ordering::Relaxed);
        info!("Creating offscreen document");

        let host = self.inner.host.clone();
        let weak = Arc::downgrade(&self.inner);
        let op = async move {
            let result = match host.create_document().await {
                Err(HostError::AlreadyExists) => {
                    debug!("Offscreen document already exists");
                    Ok(())
                }
                other => other,
            };
            set_phase(&weak, if result.is_ok() { Phase::Ready } else { Phase::Absent });
            match &result {
                Ok(()) => info!("Offscreen document ready"),
                Err(e) => warn!("{}", e),
            }
            result
        }
        .boxed()
        .shared();

        // Runs to completion even if every waiting caller goes away
        tokio::spawn(op.clone());
        op
    }

    fn start_close(&self) -> SharedOp {
        let host = self.inner.host.clone();
        let weak = Arc::downgrade(&self.inner);
        let op = async move {
            let result = host.close_document().await;
            set_phase(&weak, Phase::Absent);
            match &result {
                Ok(()) => info!("Offscreen document closed"),
                Err(e) => warn!("{}", e),
            }
            result
        }
        .boxed()
        .shared();

        tokio::spawn(op.clone());
        op
    }

    fn arm_idle_timer(&self) {
        let mut state = self.inner.state.lock();
        if !matches!(state.phase, Phase::Ready) {
            return;
        }
        state.cancel_idle_timer();
        let generation = state.idle_generation;
        let timeout = self.inner.config.idle_timeout;
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                OffscreenBridge { inner }.teardown_if_idle(generation);
            }
        });
        state.idle_task = Some(task.abort_handle());
    }

    fn teardown_if_idle(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.idle_generation != generation || !matches!(state.phase, Phase::Ready) {
            return;
        }
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            // The request finishing will re-arm the timer
            return;
        }
        debug!("Offscreen document idle for {:?}", self.inner.config.idle_timeout);
        state.idle_task = None;
        let op = self.start_close();
        state.phase = Phase::Closing(op);
    }
}

fn set_phase(inner: &Weak<BridgeInner>, phase: Phase) {
    if let Some(inner) = inner.upgrade() {
        inner.state.lock().phase = phase;
    }
}
