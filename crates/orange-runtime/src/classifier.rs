//! Image classifier capability.
//!
//! Backends are opaque: they receive decoded pixels and a sensitivity and
//! return a verdict. Which backend runs is chosen by the `aiMode` setting
//! through the registry.

use crate::message::ClassificationResult;
use async_trait::async_trait;
use image::DynamicImage;
use orange_config::{AiMode, Sensitivity};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("Model not initialized")]
    NotInitialized,

    #[error("AI mode is disabled")]
    Disabled,

    #[error("Unknown classifier backend: {0}")]
    UnknownBackend(String),

    #[error("Model load failed: {0}")]
    LoadFailed(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Backend id as used in `aiMode`
    fn id(&self) -> &str;

    async fn classify(
        &self,
        image: &DynamicImage,
        sensitivity: Sensitivity,
    ) -> Result<ClassificationResult, ClassifierError>;
}

/// Builds a backend. May be slow: called off the async threads.
pub type ClassifierFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Classifier>, ClassifierError> + Send + Sync>;

/// Backends available to the offscreen context, keyed by id
#[derive(Clone, Default)]
pub struct ClassifierRegistry {
    factories: HashMap<String, ClassifierFactory>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Classifier>, ClassifierError> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Factory for the backend selected by `mode`.
    pub fn factory_for(&self, mode: &AiMode) -> Result<ClassifierFactory, ClassifierError> {
        let id = mode.classifier_id().ok_or(ClassifierError::Disabled)?;
        self.factories
            .get(id)
            .cloned()
            .ok_or_else(|| ClassifierError::UnknownBackend(id.to_string()))
    }

    /// Build the backend selected by `mode`.
    pub fn resolve(&self, mode: &AiMode) -> Result<Arc<dyn Classifier>, ClassifierError> {
        (self.factory_for(mode)?)()
    }
}

impl fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}
