//! Orange Filter Network Rules
//!
//! Navigation-level filtering, expressed as declarative rules.
//!
//! Flow:
//! 1. Lists change → `generate_rules` builds the full rule set (pure)
//! 2. The installer removes every installed rule id and adds the new set
//! 3. Navigations are evaluated against installed rules, highest priority wins

mod url_filter;
mod rule;
mod generator;
mod engine;

pub use url_filter::UrlFilter;
pub use rule::{FilterAction, FilterRule, ResourceType, RuleAction, RuleCondition};
pub use generator::{generate_rules, KEYWORD_PRIORITY, WHITELIST_PRIORITY};
pub use engine::{DynamicRuleStore, RuleError, RuleHost, Verdict};
