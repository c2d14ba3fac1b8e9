//! Background side: relays image checks to the offscreen context and
//! tracks the coarse model status.

use crate::message::{MessageType, ModelStatus, Response};
use crate::offscreen::OffscreenBridge;
use crate::router::MessageHandler;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info};

pub struct BackgroundHandler {
    bridge: OffscreenBridge,
    status: RwLock<ModelStatus>,
}

impl BackgroundHandler {
    pub fn new(bridge: OffscreenBridge) -> Self {
        Self {
            bridge,
            status: RwLock::new(ModelStatus::Idle),
        }
    }

    pub fn model_status(&self) -> ModelStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ModelStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("Model status {:?} -> {:?}", *current, status);
            *current = status;
        }
    }

    async fn check_image(&self, data: Value) -> Response {
        // A failed warm-up is retried on the next check
        if matches!(self.model_status(), ModelStatus::Idle | ModelStatus::Error) {
            self.set_status(ModelStatus::Loading);
        }

        if let Err(e) = self.bridge.ensure_ready().await {
            error!("Failed to set up offscreen document: {}", e);
            self.set_status(ModelStatus::Error);
            return Response::error(e.to_string());
        }
        if self.model_status() != ModelStatus::Ready {
            info!("Classifier ready");
            self.set_status(ModelStatus::Ready);
        }

        match self.bridge.send(MessageType::ScanImage, data).await {
            Ok(response) => response,
            Err(e) => Response::error(e.to_string()),
        }
    }
}

#[async_trait]
impl MessageHandler for BackgroundHandler {
    async fn handle(&self, kind: MessageType, data: Value) -> Response {
        match kind {
            MessageType::Ping => Response::pong(),
            MessageType::CheckImage => self.check_image(data).await,
            MessageType::GetModelStatus => Response::model_status(self.model_status()),
            other => Response::error(format!("Unknown message type: {}", other)),
        }
    }
}
