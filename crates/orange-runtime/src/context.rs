//! Process-scoped extension state.
//!
//! One `ExtensionContext` owns everything that lives for the lifetime of the
//! background process: the router, the offscreen bridge, the model status
//! and the cached config.
//!
//! Init: `start` loads the config, registers the background handler and
//! kicks off rule sync. The offscreen document is *not* created until the
//! first image check.
//!
//! Reset: `shutdown` invalidates the router (in-flight and later page
//! requests fail with `ContextInvalidated`), stops rule sync and closes the
//! offscreen document. A fresh context must be started afterwards; a shut
//! down one is not reusable.

use crate::background::BackgroundHandler;
use crate::classifier::ClassifierRegistry;
use crate::host::InProcessOffscreenHost;
use crate::message::{ModelStatus, Target};
use crate::offscreen::{BridgeConfig, OffscreenBridge};
use crate::router::MessageRouter;
use crate::rule_sync::spawn_rule_sync;
use orange_config::{load_config, FilterConfig, Storage};
use orange_rules::RuleHost;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ExtensionContext {
    router: MessageRouter,
    storage: Arc<dyn Storage>,
    host: Arc<InProcessOffscreenHost>,
    bridge: OffscreenBridge,
    background: Arc<BackgroundHandler>,
    config: RwLock<FilterConfig>,
    rule_sync: Mutex<Option<JoinHandle<()>>>,
}

impl ExtensionContext {
    pub async fn start(
        storage: Arc<dyn Storage>,
        rule_host: Arc<dyn RuleHost>,
        registry: ClassifierRegistry,
        bridge_config: BridgeConfig,
    ) -> Self {
        let config = load_config(storage.as_ref()).await;
        let router = MessageRouter::new();

        let host = Arc::new(InProcessOffscreenHost::new(
            router.downgrade(),
            registry,
            config.settings.ai_mode.clone(),
        ));
        let bridge = OffscreenBridge::new(host.clone(), router.downgrade(), bridge_config);
        let background = Arc::new(BackgroundHandler::new(bridge.clone()));
        router.register(Target::Background, background.clone());

        let rule_sync = spawn_rule_sync(storage.clone(), rule_host);

        info!(
            "Extension started (sensitivity: {}, ai mode: {})",
            config.settings.sensitivity, config.settings.ai_mode
        );

        Self {
            router,
            storage,
            host,
            bridge,
            background,
            config: RwLock::new(config),
            rule_sync: Mutex::new(Some(rule_sync)),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn bridge(&self) -> &OffscreenBridge {
        &self.bridge
    }

    /// Config as of the last load.
    pub fn config(&self) -> FilterConfig {
        self.config.read().clone()
    }

    /// Re-read the config. A new `aiMode` applies from the next offscreen
    /// document creation.
    pub async fn reload_config(&self) -> FilterConfig {
        let config = load_config(self.storage.as_ref()).await;
        self.host.set_mode(config.settings.ai_mode.clone());
        *self.config.write() = config.clone();
        config
    }

    pub fn model_status(&self) -> ModelStatus {
        self.background.model_status()
    }

    pub async fn shutdown(&self) {
        self.router.invalidate();
        if let Some(task) = self.rule_sync.lock().take() {
            task.abort();
        }
        if let Err(e) = self.bridge.close().await {
            warn!("Failed to close offscreen document: {}", e);
        }
        info!("Extension context shut down");
    }
}
