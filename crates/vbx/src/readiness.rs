//! ⏳ Readiness: wait until the server has finished vectorizing what we sent.
//!
//! 🎬 *[every record is stored. every ack is in. the vector index queue says 48,112.
//! we wait. we poll. we log every five seconds so nobody thinks we died.]*
//!
//! A shard is caught up when it is `READY` with an empty vector queue. Transient
//! errors (network, 5xx, 429) back off and retry up to a budget. Anything the server
//! rejects outright ends the wait.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backends::{ClusterApi, ClusterBackend, ShardStatus};
use crate::config::ReadinessConfig;
use crate::error::{BatchError, ClusterError};
use crate::records::Shard;

#[derive(Debug)]
pub(crate) struct ReadinessPoller<'a> {
    cluster: &'a ClusterBackend,
    config: &'a ReadinessConfig,
}

impl<'a> ReadinessPoller<'a> {
    pub(crate) fn new(cluster: &'a ClusterBackend, config: &'a ReadinessConfig) -> Self {
        Self { cluster, config }
    }

    /// ⏳ Block until every shard in `shards` is caught up.
    pub(crate) async fn wait_for(&self, shards: &[Shard]) -> Result<(), BatchError> {
        if shards.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let mut last_log = Instant::now();
        let mut pending: Vec<&Shard> = shards.iter().collect();
        info!("⏳ waiting for vector indexing on {} shards", pending.len());
        loop {
            let mut still_busy = Vec::with_capacity(pending.len());
            let mut queued = 0u64;
            for shard in pending {
                let statuses = self.poll_shard(shard).await?;
                if !statuses.iter().all(ShardStatus::is_caught_up) {
                    queued += statuses.iter().map(|s| s.vector_queue_size).sum::<u64>();
                    still_busy.push(shard);
                }
            }
            if still_busy.is_empty() {
                info!("✅ vector indexing caught up after {:?}", started.elapsed());
                return Ok(());
            }
            if last_log.elapsed() >= self.config.log_interval() {
                info!(
                    "⏳ {} shards still indexing, {} vectors queued ({:?} so far)",
                    still_busy.len(),
                    queued,
                    started.elapsed()
                );
                last_log = Instant::now();
            }
            pending = still_busy;
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn poll_shard(&self, shard: &Shard) -> Result<Vec<ShardStatus>, BatchError> {
        let mut failures = 0u32;
        loop {
            match self.cluster.shards(shard).await {
                Ok(statuses) => return Ok(statuses),
                Err(err @ ClusterError::Transient(_)) if failures < self.config.max_retries => {
                    failures += 1;
                    let wait = backoff(self.config.backoff_base(), failures);
                    warn!(
                        "⚠️ shard status for {} unavailable ({}), retry {}/{} in {:?}",
                        shard.collection, err, failures, self.config.max_retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    debug!("💀 giving up on shard status for {}", shard.collection);
                    return Err(BatchError::Readiness(format!(
                        "shard status for {}{} failed: {}",
                        shard.collection,
                        shard
                            .tenant
                            .as_deref()
                            .map(|tenant| format!(" (tenant {tenant})"))
                            .unwrap_or_default(),
                        err
                    )));
                }
            }
        }
    }
}

fn backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ConnectionConfig;
    use crate::backends::in_mem::InMemoryServer;
    use crate::backends::rest::RestCluster;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick() -> ReadinessConfig {
        ReadinessConfig {
            enabled: true,
            max_retries: 2,
            poll_interval_ms: 5,
            log_interval_ms: 5,
            backoff_base_ms: 1,
        }
    }

    fn shard(collection: &str) -> Shard {
        Shard {
            collection: collection.into(),
            tenant: None,
        }
    }

    fn status(status: &str, queue: u64) -> ShardStatus {
        ShardStatus {
            name: "s".into(),
            status: status.into(),
            vector_queue_size: queue,
        }
    }

    #[tokio::test]
    async fn the_one_where_the_queue_drains_eventually() {
        let server = InMemoryServer::default();
        server.push_shards_response(Ok(vec![status("INDEXING", 40)]));
        server.push_shards_response(Err(ClusterError::Transient("503".into())));
        server.push_shards_response(Ok(vec![status("READY", 3)]));
        let cluster = server.cluster();
        let config = quick();
        ReadinessPoller::new(&cluster, &config)
            .wait_for(&[shard("Article")])
            .await
            .expect("catches up");
        // -- three scripted answers, then the default READY/0
        assert_eq!(server.shard_polls(), 4);
    }

    #[tokio::test]
    async fn the_one_where_the_server_stays_down_too_long() {
        let server = InMemoryServer::default();
        for _ in 0..3 {
            server.push_shards_response(Err(ClusterError::Transient("503".into())));
        }
        let cluster = server.cluster();
        let config = quick();
        let err = ReadinessPoller::new(&cluster, &config)
            .wait_for(&[shard("Article")])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Readiness(_)));
    }

    #[tokio::test]
    async fn the_one_where_a_missing_collection_is_not_retried() {
        let server = InMemoryServer::default();
        server.push_shards_response(Err(ClusterError::Rejected {
            status: 404,
            body: "no such class".into(),
        }));
        let cluster = server.cluster();
        let config = quick();
        let err = ReadinessPoller::new(&cluster, &config)
            .wait_for(&[shard("Ghost")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such class"));
        assert_eq!(server.shard_polls(), 1);
    }

    #[tokio::test]
    async fn the_one_where_readiness_goes_over_http() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/schema/Article/shards"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "a1", "status": "READY", "vectorQueueSize": 0},
                {"name": "a2", "status": "READY", "vectorQueueSize": 0}
            ])))
            .expect(1)
            .mount(&mock)
            .await;
        let rest = RestCluster::new(&ConnectionConfig::new("http://localhost:50051", mock.uri()))
            .expect("client builds");
        let cluster = ClusterBackend::Rest(rest);
        let config = quick();
        ReadinessPoller::new(&cluster, &config)
            .wait_for(&[shard("Article")])
            .await
            .expect("already caught up");
    }

    #[test]
    fn the_one_where_backoff_starts_at_the_base() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
    }
}
