//! Blocked-content statistics.
//!
//! Hide actions happen in bursts from several dispatch workers at once, so
//! increments go through one writer task instead of racing read-modify-write
//! cycles against storage.

use crate::config::Stats;
use crate::storage::{Storage, StorageError};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn read_stats(storage: &dyn Storage) -> Result<Stats, StorageError> {
    let data = storage.get_all().await?;
    Ok(data
        .get("stats")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default())
}

/// Add `count` to the persisted blocked counter. Returns the new total.
pub async fn increment_blocked_count(storage: &dyn Storage, count: u64) -> Result<u64, StorageError> {
    let mut stats = read_stats(storage).await?;
    stats.blocked_count = stats.blocked_count.saturating_add(count);
    stats.last_update = Some(now_millis());

    let mut items = Map::new();
    items.insert("stats".to_string(), serde_json::to_value(&stats)?);
    storage.set(items).await?;

    Ok(stats.blocked_count)
}

/// Persisted blocked counter, 0 when absent or unreadable.
pub async fn get_blocked_count(storage: &dyn Storage) -> u64 {
    match read_stats(storage).await {
        Ok(stats) => stats.blocked_count,
        Err(e) => {
            warn!("Failed to read stats: {}", e);
            0
        }
    }
}

/// Shared counter bumped by every hide or blur action.
///
/// Always counts for the current page; when attached to a storage it also
/// forwards increments to a background writer.
#[derive(Clone, Debug)]
pub struct BlockCounter {
    session: Arc<AtomicU64>,
    writer: Option<mpsc::UnboundedSender<u64>>,
}

impl BlockCounter {
    /// A counter that is never persisted.
    pub fn detached() -> Self {
        Self {
            session: Arc::new(AtomicU64::new(0)),
            writer: None,
        }
    }

    /// A counter persisted to `storage`. Must be called inside a tokio runtime.
    pub fn persisted(storage: Arc<dyn Storage>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(storage, rx));
        let counter = Self {
            session: Arc::new(AtomicU64::new(0)),
            writer: Some(tx),
        };
        (counter, handle)
    }

    pub fn increment(&self) {
        self.session.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = &self.writer {
            // Writer gone means the page is being torn down
            let _ = tx.send(1);
        }
    }

    /// Actions counted since this counter was created.
    pub fn session_count(&self) -> u64 {
        self.session.load(Ordering::Relaxed)
    }
}

async fn run_writer(storage: Arc<dyn Storage>, mut rx: mpsc::UnboundedReceiver<u64>) {
    while let Some(first) = rx.recv().await {
        let mut pending = first;
        while let Ok(more) = rx.try_recv() {
            pending += more;
        }
        match increment_blocked_count(storage.as_ref(), pending).await {
            Ok(total) => debug!("Blocked count now {}", total),
            Err(e) => warn!("Failed to update stats: {}", e),
        }
    }
}
