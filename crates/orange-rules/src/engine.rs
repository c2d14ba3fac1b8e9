//! Dynamic rule store
//!
//! Holds the installed rule set and evaluates navigations against it.
//! Updates are all-or-nothing: a batch that would leave duplicate or
//! invalid ids is rejected before anything changes.

use crate::rule::{FilterAction, FilterRule, ResourceType};
use crate::url_filter::UrlFilter;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Errors while installing rules
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("Rule id must be positive")]
    InvalidId,

    #[error("Duplicate rule id: {0}")]
    DuplicateId(u32),

    #[error("Rule {id} has an invalid url filter: {filter}")]
    InvalidUrlFilter { id: u32, filter: String },

    #[error("Network rule host unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of evaluating a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No rule matched, or the winning rule allows
    Allow { rule_id: Option<u32> },
    /// The winning rule blocks
    Block { rule_id: u32 },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// The network-filtering subsystem rules are installed into
#[async_trait]
pub trait RuleHost: Send + Sync {
    async fn get_dynamic_rules(&self) -> Result<Vec<FilterRule>, RuleError>;

    /// Remove `remove_rule_ids`, then add `add_rules`, atomically.
    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<FilterRule>,
    ) -> Result<(), RuleError>;
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FilterRule,
    filter: UrlFilter,
}

impl CompiledRule {
    fn compile(rule: FilterRule) -> Result<Self, RuleError> {
        if rule.id == 0 {
            return Err(RuleError::InvalidId);
        }
        let filter = rule.url_filter().ok_or_else(|| RuleError::InvalidUrlFilter {
            id: rule.id,
            filter: rule.condition.url_filter.clone(),
        })?;
        Ok(Self { rule, filter })
    }

    fn matches(&self, url: &str, resource_type: ResourceType) -> bool {
        self.rule.condition.applies_to(resource_type) && self.filter.matches(url)
    }
}

/// Evaluation statistics
#[derive(Debug, Default)]
pub struct EvaluationStats {
    pub total_checks: AtomicU64,
    pub blocked: AtomicU64,
}

/// In-process dynamic rule store
#[derive(Debug, Default)]
pub struct DynamicRuleStore {
    rules: RwLock<Vec<CompiledRule>>,
    stats: EvaluationStats,
}

impl DynamicRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed rules in install order.
    pub fn rules(&self) -> Vec<FilterRule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Remove then add, rejecting the whole batch on any invalid rule.
    pub fn update(&self, remove_rule_ids: &[u32], add_rules: Vec<FilterRule>) -> Result<(), RuleError> {
        let compiled = add_rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = self.rules.write();
        let remove: HashSet<u32> = remove_rule_ids.iter().copied().collect();

        let mut ids: HashSet<u32> = rules
            .iter()
            .map(|c| c.rule.id)
            .filter(|id| !remove.contains(id))
            .collect();
        for c in &compiled {
            if !ids.insert(c.rule.id) {
                return Err(RuleError::DuplicateId(c.rule.id));
            }
        }

        let before = rules.len();
        rules.retain(|c| !remove.contains(&c.rule.id));
        let removed = before - rules.len();
        let added = compiled.len();
        rules.extend(compiled);

        debug!("Rule store update: -{} +{} = {}", removed, added, rules.len());
        Ok(())
    }

    /// Evaluate a request. Highest priority match wins; on equal priority
    /// the earliest installed rule wins.
    pub fn evaluate(&self, url: &str, resource_type: ResourceType) -> Verdict {
        self.stats.total_checks.fetch_add(1, Ordering::Relaxed);

        let rules = self.rules.read();
        let mut winner: Option<&FilterRule> = None;
        for compiled in rules.iter() {
            if !compiled.matches(url, resource_type) {
                continue;
            }
            if winner.is_none_or(|w| compiled.rule.priority > w.priority) {
                winner = Some(&compiled.rule);
            }
        }

        match winner {
            Some(rule) if rule.action() == FilterAction::Block => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                trace!("Rule {} blocked: {}", rule.id, url);
                Verdict::Block { rule_id: rule.id }
            }
            Some(rule) => Verdict::Allow { rule_id: Some(rule.id) },
            None => Verdict::Allow { rule_id: None },
        }
    }

    /// (total checks, blocked)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.total_checks.load(Ordering::Relaxed),
            self.stats.blocked.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl RuleHost for DynamicRuleStore {
    async fn get_dynamic_rules(&self) -> Result<Vec<FilterRule>, RuleError> {
        Ok(self.rules())
    }

    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<FilterRule>,
    ) -> Result<(), RuleError> {
        self.update(&remove_rule_ids, add_rules)?;
        info!("Installed dynamic rules: {}", self.rule_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::generate_rules;
    use crate::rule::{RuleAction, RuleCondition};
    use orange_config::FilterLists;

    fn rule(id: u32, priority: u32, kind: FilterAction, filter: &str) -> FilterRule {
        FilterRule {
            id,
            priority,
            action: RuleAction { kind },
            condition: RuleCondition {
                url_filter: filter.to_string(),
                resource_types: vec![ResourceType::MainFrame],
                is_url_filter_case_sensitive: None,
            },
        }
    }

    fn store_for(whitelist: &[&str], keywords: &[&str]) -> DynamicRuleStore {
        let lists = FilterLists::new(whitelist.iter().copied(), keywords.iter().copied());
        let store = DynamicRuleStore::new();
        store.update(&[], generate_rules(&lists)).unwrap();
        store
    }

    #[test]
    fn test_keyword_blocks_navigation() {
        let store = store_for(&[], &["bad"]);

        assert!(store.evaluate("https://news.org/BAD-story", ResourceType::MainFrame).is_blocked());
        assert!(!store.evaluate("https://news.org/good", ResourceType::MainFrame).is_blocked());
        assert!(!store.evaluate("https://news.org/bad.png", ResourceType::Image).is_blocked());
    }

    #[test]
    fn test_whitelist_beats_keyword() {
        let store = store_for(&["example.com"], &["bad"]);

        assert_eq!(
            store.evaluate("https://example.com/bad", ResourceType::MainFrame),
            Verdict::Allow { rule_id: Some(1) }
        );
        assert_eq!(
            store.evaluate("https://sub.example.com/bad", ResourceType::MainFrame),
            Verdict::Allow { rule_id: Some(1) }
        );
        assert_eq!(
            store.evaluate("https://other.com/bad", ResourceType::MainFrame),
            Verdict::Block { rule_id: 2 }
        );
    }

    #[test]
    fn test_equal_priority_earliest_wins() {
        let store = DynamicRuleStore::new();
        store
            .update(
                &[],
                vec![
                    rule(7, 50, FilterAction::Block, "*x*"),
                    rule(3, 50, FilterAction::Allow, "*x*"),
                ],
            )
            .unwrap();

        assert_eq!(
            store.evaluate("https://x.org/", ResourceType::MainFrame),
            Verdict::Block { rule_id: 7 }
        );
    }

    #[test]
    fn test_update_replaces_and_rejects_duplicates() {
        let store = DynamicRuleStore::new();
        store.update(&[], vec![rule(1, 10, FilterAction::Block, "*a*")]).unwrap();

        let err = store
            .update(&[], vec![rule(1, 10, FilterAction::Block, "*b*")])
            .unwrap_err();
        assert_eq!(err, RuleError::DuplicateId(1));
        assert_eq!(store.rules()[0].condition.url_filter, "*a*");

        store.update(&[1], vec![rule(1, 10, FilterAction::Block, "*b*")]).unwrap();
        assert_eq!(store.rule_count(), 1);
        assert_eq!(store.rules()[0].condition.url_filter, "*b*");
    }

    #[test]
    fn test_update_rejects_invalid_rules() {
        let store = DynamicRuleStore::new();

        assert_eq!(
            store.update(&[], vec![rule(0, 1, FilterAction::Block, "*a*")]),
            Err(RuleError::InvalidId)
        );
        assert!(matches!(
            store.update(&[], vec![rule(2, 1, FilterAction::Block, "||")]),
            Err(RuleError::InvalidUrlFilter { id: 2, .. })
        ));
        assert_eq!(store.rule_count(), 0);
    }

    #[test]
    fn test_stats() {
        let store = store_for(&[], &["bad"]);
        store.evaluate("https://bad.org/", ResourceType::MainFrame);
        store.evaluate("https://ok.org/", ResourceType::MainFrame);

        assert_eq!(store.stats(), (2, 1));
    }

    #[tokio::test]
    async fn test_rule_host_roundtrip() {
        let store = DynamicRuleStore::new();
        let host: &dyn RuleHost = &store;

        host.update_dynamic_rules(vec![], vec![rule(1, 10, FilterAction::Block, "*a*")])
            .await
            .unwrap();
        assert_eq!(host.get_dynamic_rules().await.unwrap().len(), 1);
    }
}
