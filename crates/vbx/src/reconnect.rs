//! 🔌 Reconnection: when the stream goes away, bring it back and pick up where we left off.
//!
//! 🎬 *[the server restarts for a rolling upgrade. 4,000 records are somewhere between
//! "sent" and "stored". nobody panics. well. one log line panics a little.]*
//!
//! 1. Tear down the old generation.
//! 2. Put every cached, unresolved record back at the front of the queue, once, in order.
//! 3. Re-open with exponential backoff, optionally waiting for the cluster to be healthy.
//! 4. Hold the sender until the fresh streams say `Started`.
//!
//! A tokio mutex serializes attempts. Whoever gets it second checks the generation and
//! finds the work already done.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backends::ClusterApi;
use crate::config::ConsistencyLevel;
use crate::engine::{EngineShared, EngineState};
use crate::error::BatchError;

#[derive(Debug, Default)]
pub(crate) struct ReconnectionManager {
    guard: Mutex<()>,
}

impl ReconnectionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🔁 Reconnect after generation `observed_generation` failed. A no-op if someone
    /// already replaced it.
    pub(crate) async fn reestablish(
        &self,
        shared: &EngineShared,
        observed_generation: u64,
        reason: &str,
    ) -> Result<(), BatchError> {
        let _guard = self.guard.lock().await;
        if shared.transport.generation() != observed_generation {
            debug!(
                "🔌 generation {} already replaced, nothing to do",
                observed_generation
            );
            return Ok(());
        }
        warn!(
            "🔌 lost stream generation {} ({}), reconnecting",
            observed_generation, reason
        );
        shared.set_state(EngineState::Reconnecting);
        shared.gate.set_reconnecting(true);
        shared.transport.teardown();

        let replay = shared.inflight.drain_for_replay();
        if !replay.is_empty() {
            info!("🔁 replaying {} unresolved records", replay.len());
            shared.queue.prepend(replay);
        }

        let result = self.establish(shared, false).await.map(|_| ());
        shared.gate.set_reconnecting(false);
        result
    }

    /// 📡 Open a fresh generation, retrying with `base * 2^attempt` between attempts.
    pub(crate) async fn establish(
        &self,
        shared: &EngineShared,
        first_connect: bool,
    ) -> Result<u64, BatchError> {
        let attempts = shared.config.reconnect_attempts.max(1);
        let base = shared.config.reconnect_base_delay();
        let mut last_error = String::from("no attempt was made");
        for attempt in 1..=attempts {
            match self.attempt(shared).await {
                Ok(generation) => {
                    if first_connect {
                        debug!("📡 connected, generation {}", generation);
                    } else {
                        info!(
                            "✅ reconnected on attempt {}, generation {}",
                            attempt, generation
                        );
                    }
                    shared.gate.set_shutting_down(false);
                    shared.gate.mark_awaiting_started();
                    return Ok(generation);
                }
                Err(err) => {
                    warn!(
                        "🔌 connection attempt {}/{} failed: {}",
                        attempt, attempts, err
                    );
                    last_error = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff(base, attempt)).await;
            }
        }
        Err(BatchError::StreamReestablish {
            attempts,
            last_error,
        })
    }

    async fn attempt(&self, shared: &EngineShared) -> Result<u64, String> {
        let strict = shared.config.consistency_level == ConsistencyLevel::All;
        match shared.cluster.nodes().await {
            Ok(nodes) if strict || nodes.len() <= 1 => {
                if let Some(node) = nodes.iter().find(|node| !node.is_healthy()) {
                    return Err(format!("node {} is {}", node.name, node.status));
                }
                if nodes.is_empty() {
                    return Err("the cluster reported no nodes".into());
                }
            }
            Ok(_) => {}
            Err(err) if strict => return Err(format!("health check failed: {err}")),
            Err(err) => debug!("🩺 skipping health check: {}", err),
        }
        shared
            .transport
            .open_generation(shared.admission.concurrency())
            .await
            .map_err(|err| err.to_string())
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_waits_double() {
        let base = Duration::from_secs(1);
        let waits: Vec<u64> = (1..=5).map(|n| backoff(base, n).as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 32]);
    }
}
