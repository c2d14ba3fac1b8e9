//! Declarative network rule model.
//!
//! Serializes to the same JSON shape the browser's dynamic rule API takes:
//!
//! ```json
//! { "id": 1, "priority": 100, "action": { "type": "allow" },
//!   "condition": { "urlFilter": "||example.com^", "resourceTypes": ["main_frame"] } }
//! ```

use crate::url_filter::UrlFilter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// Block the request
    Block,
    /// Allow the request, overriding lower priority blocks
    Allow,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Allow => write!(f, "allow"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: FilterAction,
}

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Top-level navigation
    #[serde(rename = "main_frame")]
    MainFrame,
    #[serde(rename = "sub_frame")]
    SubFrame,
    #[serde(rename = "stylesheet")]
    Stylesheet,
    #[serde(rename = "script")]
    Script,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "font")]
    Font,
    #[serde(rename = "xmlhttprequest")]
    XmlHttpRequest,
    #[serde(rename = "media")]
    Media,
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "other")]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub url_filter: String,
    pub resource_types: Vec<ResourceType>,
    /// Absent means case-insensitive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_url_filter_case_sensitive: Option<bool>,
}

impl RuleCondition {
    pub fn case_sensitive(&self) -> bool {
        self.is_url_filter_case_sensitive.unwrap_or(false)
    }

    pub fn applies_to(&self, resource_type: ResourceType) -> bool {
        self.resource_types.is_empty() || self.resource_types.contains(&resource_type)
    }
}

/// A single network rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Unique positive id within one installed set
    pub id: u32,
    /// Higher wins when several rules match
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl FilterRule {
    pub fn action(&self) -> FilterAction {
        self.action.kind
    }

    /// Compile the rule's URL filter.
    pub fn url_filter(&self) -> Option<UrlFilter> {
        UrlFilter::parse(&self.condition.url_filter, self.condition.case_sensitive())
    }

    /// Check if this rule matches a request. Compiles the filter on every
    /// call; the rule store keeps compiled filters for the hot path.
    pub fn matches(&self, url: &str, resource_type: ResourceType) -> bool {
        self.condition.applies_to(resource_type)
            && self.url_filter().is_some_and(|f| f.matches(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_rule(filter: &str) -> FilterRule {
        FilterRule {
            id: 1,
            priority: 10,
            action: RuleAction { kind: FilterAction::Block },
            condition: RuleCondition {
                url_filter: filter.to_string(),
                resource_types: vec![ResourceType::MainFrame],
                is_url_filter_case_sensitive: Some(false),
            },
        }
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(block_rule("*bad*")).unwrap();

        assert_eq!(
            value,
            json!({
                "id": 1,
                "priority": 10,
                "action": { "type": "block" },
                "condition": {
                    "urlFilter": "*bad*",
                    "resourceTypes": ["main_frame"],
                    "isUrlFilterCaseSensitive": false
                }
            })
        );
    }

    #[test]
    fn test_case_flag_omitted_when_unset() {
        let mut rule = block_rule("||a.com^");
        rule.condition.is_url_filter_case_sensitive = None;

        let value = serde_json::to_value(&rule).unwrap();
        assert!(value["condition"].get("isUrlFilterCaseSensitive").is_none());
    }

    #[test]
    fn test_resource_type_scoping() {
        let rule = block_rule("*bad*");

        assert!(rule.matches("https://bad.org/", ResourceType::MainFrame));
        assert!(!rule.matches("https://bad.org/x.png", ResourceType::Image));
    }
}
