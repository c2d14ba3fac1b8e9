//! Message types exchanged between the page, background and offscreen
//! contexts.

use orange_config::Sensitivity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Logical receiver of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Background,
    Offscreen,
}

impl Target {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "background" => Some(Self::Background),
            "offscreen" => Some(Self::Offscreen),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Offscreen => "offscreen",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request type, dispatched on by the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Liveness check
    Ping,
    /// Page → background: classify this image
    CheckImage,
    /// Background → offscreen: run the classifier
    ScanImage,
    /// Coarse classifier warm-up state
    GetModelStatus,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PING" => Some(Self::Ping),
            "CHECK_IMAGE" => Some(Self::CheckImage),
            "SCAN_IMAGE" => Some(Self::ScanImage),
            "GET_MODEL_STATUS" => Some(Self::GetModelStatus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::CheckImage => "CHECK_IMAGE",
            Self::ScanImage => "SCAN_IMAGE",
            Self::GetModelStatus => "GET_MODEL_STATUS",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire request: `{ target, type, data }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn new(target: Target, kind: MessageType, data: Value) -> Self {
        Self {
            target: target.as_str().to_string(),
            kind: kind.as_str().to_string(),
            data,
        }
    }
}

/// Classifier warm-up state reported by the background
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

/// Encoding of the image bytes in a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Base64,
    Blob,
}

/// `CHECK_IMAGE` / `SCAN_IMAGE` request data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Data URL or bare base64 when `kind` is base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PayloadKind>,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_mode: Option<bool>,
}

impl ImagePayload {
    pub fn new(url: Option<String>, sensitivity: Sensitivity) -> Self {
        Self {
            url,
            data: None,
            kind: None,
            sensitivity,
            strict_mode: None,
        }
    }

    pub fn with_base64(mut self, data_url: String) -> Self {
        self.data = Some(data_url);
        self.kind = Some(PayloadKind::Base64);
        self
    }

    /// `strictMode` overrides the configured sensitivity.
    pub fn effective_sensitivity(&self) -> Sensitivity {
        if self.strict_mode == Some(true) {
            Sensitivity::Strict
        } else {
            self.sensitivity
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of one classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub success: bool,
    pub is_blocked: bool,
    /// In `[0, 1]`
    pub confidence: f32,
    /// Which detector produced the result
    pub layer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassificationResult {
    /// Turn a raw backend score into a verdict for `sensitivity`.
    pub fn from_score(confidence: f32, layer: impl Into<String>, sensitivity: Sensitivity) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Self {
            success: true,
            is_blocked: confidence >= sensitivity.block_threshold(),
            confidence,
            layer: layer.into(),
            error: None,
        }
    }

    pub fn failure(layer: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            is_blocked: false,
            confidence: 0.0,
            layer: layer.into(),
            error: Some(error.into()),
        }
    }

    /// Confidence as a whole percentage, for log and placeholder text.
    pub fn confidence_pct(&self) -> u32 {
        (self.confidence * 100.0).round() as u32
    }
}

/// Wire response: `{ success, ...typed fields, error? }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ModelStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn pong() -> Self {
        Self {
            success: true,
            data: Some(Value::String("PONG".to_string())),
            ..Self::default()
        }
    }

    pub fn model_status(status: ModelStatus) -> Self {
        Self {
            success: true,
            status: Some(status),
            ..Self::default()
        }
    }

    /// Read a classification out of a successful response.
    pub fn classification(&self) -> Option<ClassificationResult> {
        if !self.success {
            return None;
        }
        Some(ClassificationResult {
            success: true,
            is_blocked: self.is_blocked.unwrap_or(false),
            confidence: self.confidence.unwrap_or(0.0),
            layer: self.layer.clone().unwrap_or_default(),
            error: None,
        })
    }
}

impl From<ClassificationResult> for Response {
    fn from(result: ClassificationResult) -> Self {
        Self {
            success: result.success,
            is_blocked: Some(result.is_blocked),
            confidence: Some(result.confidence),
            layer: Some(result.layer),
            error: result.error,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(Target::Background, MessageType::CheckImage, json!({ "url": "u" }));
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value, json!({ "target": "background", "type": "CHECK_IMAGE", "data": { "url": "u" } }));
    }

    #[test]
    fn test_message_type_parse() {
        for kind in [
            MessageType::Ping,
            MessageType::CheckImage,
            MessageType::ScanImage,
            MessageType::GetModelStatus,
        ] {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::parse("ping"), None);
        assert_eq!(Target::parse("popup"), None);
    }

    #[test]
    fn test_scan_response_shape() {
        let result = ClassificationResult::from_score(0.9, "nsfw", Sensitivity::Balanced);
        let value = serde_json::to_value(Response::from(result)).unwrap();

        assert_eq!(value["success"], true);
        assert_eq!(value["isBlocked"], true);
        assert_eq!(value["layer"], "nsfw");
        assert!(value.get("error").is_none());
        assert!(value.get("status").is_none());
    }

    #[test]
    fn test_thresholds_follow_sensitivity() {
        assert!(ClassificationResult::from_score(0.75, "l", Sensitivity::Strict).is_blocked);
        assert!(!ClassificationResult::from_score(0.75, "l", Sensitivity::Balanced).is_blocked);
        assert!(!ClassificationResult::from_score(0.9, "l", Sensitivity::Light).is_blocked);
        assert_eq!(ClassificationResult::from_score(1.7, "l", Sensitivity::Light).confidence, 1.0);
    }

    #[test]
    fn test_failed_response_has_no_classification() {
        assert!(Response::error("boom").classification().is_none());

        let ok: Response = serde_json::from_value(json!({
            "success": true, "isBlocked": false, "confidence": 0.7, "layer": "x"
        }))
        .unwrap();
        let result = ok.classification().unwrap();
        assert!(!result.is_blocked);
        assert_eq!(result.confidence_pct(), 70);
    }

    #[test]
    fn test_payload_strict_mode() {
        let mut payload = ImagePayload::new(None, Sensitivity::Light);
        assert_eq!(payload.effective_sensitivity(), Sensitivity::Light);

        payload.strict_mode = Some(true);
        assert_eq!(payload.effective_sensitivity(), Sensitivity::Strict);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = ImagePayload::new(Some("https://a/b.png".into()), Sensitivity::Balanced)
            .with_base64("data:image/png;base64,AAAA".into());
        let value = payload.to_value();

        assert_eq!(value["type"], "base64");
        assert_eq!(value["sensitivity"], "balanced");
        assert!(value.get("strictMode").is_none());
    }
}
