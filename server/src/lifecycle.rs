//! Lifecycle Manager. A single background reaper: on each tick, find instances
//! with no subscribers idle past `idle_ttl_ms`, run their `unmount` hook, and remove them
//! from the Instance Store. Eviction reuses the same path a client-driven close would: an
//! `Unmount` mailbox item, so an in-flight invoke in the worker's queue still drains
//! before teardown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::instance::MailboxItem;
use crate::state::AppState;

/// Spawn the idle-instance reaper. Runs every `reaper_interval_secs`.
pub fn spawn_reaper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(state.config.reaper_interval_secs));
        loop {
            tick.tick().await;
            reap_idle_instances(&state).await;
        }
    });
}

async fn reap_idle_instances(state: &Arc<AppState>) {
    let cutoff_ms = chrono::Utc::now().timestamp_millis() - state.config.idle_ttl_ms as i64;
    let idle_ids = state.instances.idle_instance_ids(cutoff_ms);
    if idle_ids.is_empty() {
        return;
    }

    for id in &idle_ids {
        let Some(instance) = state.instances.get(id) else { continue };
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if instance.mailbox_tx.send(MailboxItem::Unmount { done: done_tx }).await.is_err() {
            // Worker already gone; drop it from the catalogue directly.
            state.instances.remove(id);
            continue;
        }
        if tokio::time::timeout(Duration::from_secs(5), done_rx).await.is_err() {
            warn!(instance_id = %id, "unmount did not complete within timeout");
        }
    }
    info!(count = idle_ids.len(), "reaped idle instances");
}
