//! 📈 The admission ticker: once a tick, ask the cluster how deep its batch queues are.
//!
//! Only runs in dynamic mode. Per-node statistics are summed, so the controller
//! sees the cluster as one big queue with one big processing rate.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::Worker;
use crate::backends::{ClusterApi, NodeStatus};
use crate::engine::EngineShared;
use crate::error::BatchError;

#[derive(Debug)]
pub(crate) struct AdmissionTicker {
    shared: Arc<EngineShared>,
}

impl AdmissionTicker {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    async fn run(self) -> Result<(), BatchError> {
        let shared = self.shared;
        let mut interval = tokio::time::interval(shared.config.admission_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("📈 admission ticker started");
        loop {
            interval.tick().await;
            if shared.is_stopping() || shared.check_fatal().is_err() {
                debug!("📈 admission ticker done");
                return Ok(());
            }
            match shared.cluster.nodes().await {
                Ok(nodes) => {
                    if let Some((queue_length, rate)) = cluster_load(&nodes) {
                        shared.admission.observe(queue_length, rate);
                    }
                }
                Err(err) => trace!("📈 node statistics unavailable this tick: {}", err),
            }
        }
    }
}

/// ➕ Total queue length and processing rate, `None` if no node reported statistics.
fn cluster_load(nodes: &[NodeStatus]) -> Option<(u64, f64)> {
    nodes
        .iter()
        .filter_map(|node| node.batch_stats.as_ref())
        .fold(None, |total, stats| {
            let (queue, rate) = total.unwrap_or((0, 0.0));
            Some((queue + stats.queue_length, rate + stats.rate_per_second))
        })
}

impl Worker for AdmissionTicker {
    fn start(self) -> JoinHandle<Result<(), BatchError>> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BatchStats;

    fn node(stats: Option<(u64, f64)>) -> NodeStatus {
        NodeStatus {
            name: "n".into(),
            status: "HEALTHY".into(),
            batch_stats: stats.map(|(queue_length, rate_per_second)| BatchStats {
                queue_length,
                rate_per_second,
            }),
        }
    }

    #[test]
    fn the_one_where_the_cluster_is_one_big_queue() {
        let nodes = vec![node(Some((10, 100.0))), node(None), node(Some((5, 50.0)))];
        assert_eq!(cluster_load(&nodes), Some((15, 150.0)));
    }

    #[test]
    fn the_one_where_nobody_reports_anything() {
        assert_eq!(cluster_load(&[node(None)]), None);
        assert_eq!(cluster_load(&[]), None);
    }
}
