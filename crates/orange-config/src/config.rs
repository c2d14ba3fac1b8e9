//! Filter configuration model.
//!
//! Field names match the JSON document shared with the popup and options
//! pages (`enabledGlobal`, `aiMode`, `userKeywords`, ...).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Version of the stored document layout
pub const CONFIG_VERSION: u32 = 2;

/// How aggressively pages are filtered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sensitivity {
    /// Lowest block threshold
    Strict,
    /// Default
    #[default]
    Balanced,
    /// Only very confident classifier hits are hidden
    Light,
    /// Text containers are left alone, images are still filtered
    PicturesOnly,
}

impl Sensitivity {
    /// Classifier confidence at or above which an image is blocked outright.
    pub fn block_threshold(&self) -> f32 {
        match self {
            Self::Strict => 0.70,
            Self::Balanced | Self::PicturesOnly => 0.85,
            Self::Light => 0.95,
        }
    }

    /// Whether text containers are scanned at all.
    pub fn filters_text(&self) -> bool {
        !matches!(self, Self::PicturesOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Balanced => "balanced",
            Self::Light => "light",
            Self::PicturesOnly => "pictures-only",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which image classifier backend to use, if any.
///
/// Stored as a plain string: `"none"` or the backend id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AiMode {
    None,
    Classifier(String),
}

impl AiMode {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Backend id, `None` when classification is off.
    pub fn classifier_id(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Classifier(id) => Some(id),
        }
    }
}

impl Default for AiMode {
    fn default() -> Self {
        Self::Classifier("mobilenet".to_string())
    }
}

impl From<String> for AiMode {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            Self::None
        } else {
            Self::Classifier(trimmed.to_string())
        }
    }
}

impl From<AiMode> for String {
    fn from(mode: AiMode) -> Self {
        match mode {
            AiMode::None => "none".to_string(),
            AiMode::Classifier(id) => id,
        }
    }
}

impl fmt::Display for AiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Classifier(id) => f.write_str(id),
        }
    }
}

/// User-facing switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub enabled_global: bool,
    pub sensitivity: Sensitivity,
    pub ai_mode: AiMode,
    /// The user agreed to on-device image analysis
    pub ai_consent: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled_global: true,
            sensitivity: Sensitivity::Balanced,
            ai_mode: AiMode::default(),
            ai_consent: false,
        }
    }
}

impl Settings {
    /// Images may only be sent to a classifier when a backend is selected
    /// and the user consented.
    pub fn ai_dispatch_enabled(&self) -> bool {
        !self.ai_mode.is_none() && self.ai_consent
    }

    fn merge(&mut self, raw: &Value) {
        let Some(obj) = raw.as_object() else {
            warn!("Ignoring non-object 'settings' in stored config");
            return;
        };
        merge_field(obj, "enabledGlobal", &mut self.enabled_global);
        merge_field(obj, "sensitivity", &mut self.sensitivity);
        merge_field(obj, "aiMode", &mut self.ai_mode);
        merge_field(obj, "aiConsent", &mut self.ai_consent);
    }
}

/// Whitelisted domains and blocked keywords
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterLists {
    pub whitelist: Vec<String>,
    pub user_keywords: Vec<String>,
}

impl Default for FilterLists {
    fn default() -> Self {
        Self {
            whitelist: vec!["example.com".to_string()],
            user_keywords: vec!["trump".to_string()],
        }
    }
}

impl FilterLists {
    pub fn new<W, K>(whitelist: W, user_keywords: K) -> Self
    where
        W: IntoIterator,
        W::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let mut lists = Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            user_keywords: user_keywords.into_iter().map(Into::into).collect(),
        };
        lists.normalize();
        lists
    }

    /// Trim entries, drop empties, lowercase and de-duplicate domains.
    ///
    /// Keyword order is kept as entered.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.whitelist = self
            .whitelist
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty() && seen.insert(d.clone()))
            .collect();
        self.user_keywords = self
            .user_keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
    }

    /// Exact hostname match against the whitelist.
    pub fn is_whitelisted(&self, hostname: &str) -> bool {
        let host = hostname.trim().to_lowercase();
        self.whitelist.iter().any(|d| *d == host)
    }

    fn merge(&mut self, raw: &Value) {
        let Some(obj) = raw.as_object() else {
            warn!("Ignoring non-object 'lists' in stored config");
            return;
        };
        merge_field(obj, "whitelist", &mut self.whitelist);
        merge_field(obj, "userKeywords", &mut self.user_keywords);
    }
}

/// Blocked-content counter shown in the popup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub blocked_count: u64,
    /// Unix time in milliseconds of the last increment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

/// The complete stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub version: u32,
    pub settings: Settings,
    pub lists: FilterLists,
    #[serde(default)]
    pub stats: Stats,
    /// Top-level keys written by other pages, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: Settings::default(),
            lists: FilterLists::default(),
            stats: Stats::default(),
            extra: Map::new(),
        }
    }
}

impl FilterConfig {
    /// Merge a stored document onto the defaults.
    ///
    /// `settings` and `lists` merge key by key; a key whose value has the
    /// wrong shape keeps its default.
    pub fn from_stored(raw: &Value) -> Self {
        let mut config = Self::default();

        let Some(obj) = raw.as_object() else {
            if !raw.is_null() {
                warn!("Stored config is not an object, using defaults");
            }
            return config;
        };

        for (key, value) in obj {
            match key.as_str() {
                "version" => {
                    if let Some(v) = value.as_u64().and_then(|v| u32::try_from(v).ok()) {
                        config.version = v;
                    }
                }
                "settings" => config.settings.merge(value),
                "lists" => config.lists.merge(value),
                "stats" => match serde_json::from_value(value.clone()) {
                    Ok(stats) => config.stats = stats,
                    Err(e) => warn!("Ignoring invalid stored stats: {}", e),
                },
                _ => {
                    config.extra.insert(key.clone(), value.clone());
                }
            }
        }

        config.lists.normalize();
        config
    }

    /// Serialize to the stored document shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn merge_field<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str, slot: &mut T) {
    if let Some(value) = obj.get(key) {
        match serde_json::from_value(value.clone()) {
            Ok(v) => *slot = v,
            Err(e) => warn!("Ignoring invalid config value for '{}': {}", key, e),
        }
    }
}
