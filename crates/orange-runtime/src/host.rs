//! In-process offscreen host: "creating the document" loads the selected
//! classifier and registers its handler with the router.

use crate::classifier::ClassifierRegistry;
use crate::offscreen::{HostError, OffscreenHost};
use crate::message::Target;
use crate::router::WeakRouter;
use crate::worker::OffscreenHandler;
use async_trait::async_trait;
use orange_config::AiMode;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub struct InProcessOffscreenHost {
    router: WeakRouter,
    registry: ClassifierRegistry,
    mode: RwLock<AiMode>,
}

impl InProcessOffscreenHost {
    pub fn new(router: WeakRouter, registry: ClassifierRegistry, mode: AiMode) -> Self {
        Self {
            router,
            registry,
            mode: RwLock::new(mode),
        }
    }

    /// Takes effect on the next document creation.
    pub fn set_mode(&self, mode: AiMode) {
        let mut current = self.mode.write();
        if *current != mode {
            debug!("Offscreen classifier mode changed to {}", mode);
            *current = mode;
        }
    }

    pub fn mode(&self) -> AiMode {
        self.mode.read().clone()
    }
}

#[async_trait]
impl OffscreenHost for InProcessOffscreenHost {
    async fn create_document(&self) -> Result<(), HostError> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| HostError::CreateFailed("router is gone".to_string()))?;
        if router.is_registered(Target::Offscreen) {
            return Err(HostError::AlreadyExists);
        }

        let mode = self.mode();
        let factory = self
            .registry
            .factory_for(&mode)
            .map_err(|e| HostError::CreateFailed(e.to_string()))?;

        // Model loading is blocking work
        let classifier = tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| HostError::CreateFailed(e.to_string()))?
            .map_err(|e| HostError::CreateFailed(e.to_string()))?;

        info!("Loaded classifier {}", classifier.id());
        if router.register_if_absent(Target::Offscreen, Arc::new(OffscreenHandler::new(classifier))) {
            Ok(())
        } else {
            Err(HostError::AlreadyExists)
        }
    }

    async fn close_document(&self) -> Result<(), HostError> {
        if let Some(router) = self.router.upgrade() {
            router.unregister(Target::Offscreen);
        }
        Ok(())
    }
}
