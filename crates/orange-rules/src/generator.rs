//! Rule generation from the user's lists.
//!
//! Pure and deterministic: the same lists always produce the same rules,
//! ids 1..=n, allow rules first. Installed rules are replaced wholesale on
//! every change, so ids carry no meaning across calls.

use crate::rule::{FilterAction, FilterRule, ResourceType, RuleAction, RuleCondition};
use crate::url_filter::UrlFilter;
use orange_config::FilterLists;
use tracing::warn;

/// Whitelisted domains outrank keyword blocks
pub const WHITELIST_PRIORITY: u32 = 100;

pub const KEYWORD_PRIORITY: u32 = 10;

/// Build the navigation rule set for `lists`.
///
/// Entries that cannot form a usable filter (a keyword made only of `*`
/// or `^`, say) are skipped so the rest of the set still installs.
pub fn generate_rules(lists: &FilterLists) -> Vec<FilterRule> {
    let mut rules = Vec::with_capacity(lists.whitelist.len() + lists.user_keywords.len());

    for domain in lists.whitelist.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
        push_rule(&mut rules, WHITELIST_PRIORITY, FilterAction::Allow, format!("||{}^", domain), None);
    }
    for keyword in lists.user_keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
        push_rule(&mut rules, KEYWORD_PRIORITY, FilterAction::Block, format!("*{}*", keyword), Some(false));
    }

    rules
}

fn push_rule(
    rules: &mut Vec<FilterRule>,
    priority: u32,
    kind: FilterAction,
    url_filter: String,
    case_sensitive: Option<bool>,
) {
    if UrlFilter::parse(&url_filter, case_sensitive.unwrap_or(false)).is_none() {
        warn!("Skipping unusable filter entry '{}'", url_filter);
        return;
    }
    rules.push(FilterRule {
        id: rules.len() as u32 + 1,
        priority,
        action: RuleAction { kind },
        condition: RuleCondition {
            url_filter,
            resource_types: vec![ResourceType::MainFrame],
            is_url_filter_case_sensitive: case_sensitive,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(whitelist: &[&str], keywords: &[&str]) -> FilterLists {
        FilterLists {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            user_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_whitelist_and_keyword() {
        let rules = generate_rules(&lists(&["example.com"], &["bad"]));

        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].id, 1);
        assert_eq!(rules[0].priority, 100);
        assert_eq!(rules[0].action(), FilterAction::Allow);
        assert_eq!(rules[0].condition.url_filter, "||example.com^");
        assert_eq!(rules[0].condition.resource_types, vec![ResourceType::MainFrame]);

        assert_eq!(rules[1].id, 2);
        assert_eq!(rules[1].priority, 10);
        assert_eq!(rules[1].action(), FilterAction::Block);
        assert_eq!(rules[1].condition.url_filter, "*bad*");
        assert!(!rules[1].condition.case_sensitive());
    }

    #[test]
    fn test_empty_lists() {
        assert!(generate_rules(&lists(&[], &[])).is_empty());
    }

    #[test]
    fn test_skips_empty_entries() {
        let rules = generate_rules(&lists(&["", "a.com", "  "], &["", "x"]));

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].condition.url_filter, "||a.com^");
        assert_eq!(rules[1].condition.url_filter, "*x*");
    }

    #[test]
    fn test_allow_rules_precede_blocks_with_contiguous_ids() {
        let rules = generate_rules(&lists(&["a.com", "b.com"], &["k1", "k2", "k3"]));

        let ids: Vec<u32> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let actions: Vec<FilterAction> = rules.iter().map(|r| r.action()).collect();
        assert_eq!(
            actions,
            vec![
                FilterAction::Allow,
                FilterAction::Allow,
                FilterAction::Block,
                FilterAction::Block,
                FilterAction::Block
            ]
        );
    }

    #[test]
    fn test_skips_wildcard_only_keywords() {
        let rules = generate_rules(&lists(&["example.com", "*.bad"], &["casino", "*", "^", "**"]));

        let filters: Vec<&str> = rules.iter().map(|r| r.condition.url_filter.as_str()).collect();
        assert_eq!(filters, vec!["||example.com^", "*casino*"]);
        let ids: Vec<u32> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(rules.iter().all(|r| r.url_filter().is_some()));
    }

    #[test]
    fn test_deterministic() {
        let input = lists(&["a.com"], &["k"]);
        assert_eq!(generate_rules(&input), generate_rules(&input));
    }
}
