//! Background sweep over connection liveness.
//!
//! The transport closes most dead sockets itself. The sweep catches the
//! rest: half-open connections that stopped heartbeating, users who went
//! idle long enough to become `away`, and status writes that failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::presence::PresenceEngine;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub resynced: usize,
    pub pruned: usize,
}

/// One pass. Eviction goes through the normal disconnect path, which also
/// drops the connection's outbound channel so its socket task exits.
pub async fn sweep(presence: &Arc<PresenceEngine>) -> SweepReport {
    let mut report = SweepReport::default();
    let stale_after = presence.config().stale_connection_after;

    let mut pending = Vec::new();
    for connection_id in presence.registry().stale_connections(stale_after) {
        tracing::info!(connection_id = %connection_id, ?stale_after, "evicting stale connection");
        report.evicted += 1;
        if let Some(handle) = presence.on_disconnect(&connection_id) {
            pending.push(handle);
        }
    }

    let mut candidates = presence.registry().online_users();
    candidates.extend(presence.dirty_users());
    candidates.sort();
    candidates.dedup();

    for user_id in candidates {
        if presence.needs_resync(&user_id).await {
            presence.sync(&user_id).await;
            report.resynced += 1;
        }
    }

    for handle in pending {
        let _ = handle.await;
    }

    report.pruned = presence.prune_idle_slots();
    report
}

/// Spawn the sweep loop.
pub fn spawn(presence: Arc<PresenceEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // First tick fires immediately; skip it.
        loop {
            ticker.tick().await;
            let report = sweep(&presence).await;
            if report != SweepReport::default() {
                tracing::debug!(
                    evicted = report.evicted,
                    resynced = report.resynced,
                    pruned = report.pruned,
                    "liveness sweep"
                );
            }
        }
    })
}
