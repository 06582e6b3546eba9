//! Session liveness: protocol pings, last-seen tracking, eviction.
//!
//! One task per replica.  Pings go out every `ping_interval`; the sweep
//! runs every `cleanup_interval` and evicts clients idle longer than twice
//! that, using the standard close path.  The sweep also re-asserts the
//! replica's directory records before their TTL lapses.

use crate::registry::CloseReason;
use crate::state::AppState;
use tokio::task::JoinHandle;
use tracing::warn;

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(state.config.ping_interval);
        let mut sweep = tokio::time::interval(state.config.cleanup_interval);
        // Consume the immediate first ticks.
        ping.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    for client_id in state.registry.client_ids().await {
                        state.registry.ping(&client_id).await;
                    }
                }
                _ = sweep.tick() => {
                    let threshold = state.config.eviction_threshold();
                    for entry in state.registry.entries().await {
                        if entry.idle() > threshold {
                            warn!(
                                client_id = %entry.client_id,
                                idle_ms = entry.idle().as_millis() as u64,
                                "evicting inactive client"
                            );
                            state
                                .registry
                                .close(&entry.client_id, CloseReason::Evicted)
                                .await;
                        }
                    }
                    state.registry.refresh_ownership().await;
                    state.publish_replica_addr().await;
                }
            }
        }
    })
}
