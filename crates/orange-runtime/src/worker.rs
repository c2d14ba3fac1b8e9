//! Offscreen side: decodes payloads and runs the classifier.

use crate::classifier::Classifier;
use crate::message::{ImagePayload, MessageType, Response};
use crate::router::MessageHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct OffscreenHandler {
    classifier: Arc<dyn Classifier>,
}

impl OffscreenHandler {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    async fn scan_image(&self, data: Value) -> Response {
        let payload: ImagePayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Response::error(format!("Invalid image payload: {}", e)),
        };

        let image = match payload.decode_image() {
            Ok(image) => image,
            Err(e) => {
                debug!("Cannot decode payload for {:?}: {}", payload.url, e);
                return Response::error(e.to_string());
            }
        };

        match self.classifier.classify(&image, payload.effective_sensitivity()).await {
            Ok(result) => {
                debug!(
                    "{} scored {}% (blocked: {})",
                    result.layer,
                    result.confidence_pct(),
                    result.is_blocked
                );
                result.into()
            }
            Err(e) => {
                warn!("Classification failed: {}", e);
                Response::error(e.to_string())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for OffscreenHandler {
    async fn handle(&self, kind: MessageType, data: Value) -> Response {
        match kind {
            MessageType::Ping => Response::pong(),
            MessageType::ScanImage => self.scan_image(data).await,
            other => Response::error(format!("Unknown message type: {}", other)),
        }
    }
}
