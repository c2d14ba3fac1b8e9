//! Keeps the installed network rules in step with the stored lists.

use orange_config::{load_config, Storage};
use orange_rules::{generate_rules, RuleError, RuleHost};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Regenerate rules from storage and replace every installed dynamic rule.
///
/// Returns the number of active rules.
pub async fn update_rules(storage: &dyn Storage, host: &dyn RuleHost) -> Result<usize, RuleError> {
    let config = load_config(storage).await;
    let rules = generate_rules(&config.lists);

    let remove_ids: Vec<u32> = host.get_dynamic_rules().await?.iter().map(|r| r.id).collect();
    let count = rules.len();
    host.update_dynamic_rules(remove_ids, rules).await?;

    info!("Rules updated. Active rules: {}", count);
    Ok(count)
}

/// Sync once now, then again whenever `lists` changes.
pub fn spawn_rule_sync(storage: Arc<dyn Storage>, host: Arc<dyn RuleHost>) -> JoinHandle<()> {
    // Subscribe first so a change racing the initial sync is not lost
    let mut changes = storage.subscribe();

    tokio::spawn(async move {
        if let Err(e) = update_rules(storage.as_ref(), host.as_ref()).await {
            warn!("Initial rule sync failed: {}", e);
        }

        loop {
            let resync = match changes.recv().await {
                Ok(change) => change.touches("lists"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Missed {} storage notifications", skipped);
                    true
                }
                Err(RecvError::Closed) => break,
            };
            if resync {
                if let Err(e) = update_rules(storage.as_ref(), host.as_ref()).await {
                    warn!("Rule sync failed: {}", e);
                }
            }
        }
        debug!("Rule sync stopped");
    })
}
