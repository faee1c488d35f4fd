//! 🚀 vbx: adaptive streaming batch ingestion for a vector database.
//!
//! 🎬 *[ten million objects. one long-lived gRPC stream per worker. a server that
//! restarts when it feels like it. the batch size breathes in and out with the server's
//! queue, and nothing gets lost on the way.]*
//!
//! The library is the [`BatchClient`] (async) and [`blocking::BatchClient`] (sync), both
//! fronting the same engine. [`run`] is what the `vbx` binary does with them: read NDJSON,
//! add every line, flush, optionally wait for vector indexing, report.

pub mod admission;
pub mod app_config;
pub mod backends;
pub mod blocking;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod records;
pub mod results;
pub mod source;
pub mod transport;

pub(crate) mod dispatch;
pub(crate) mod inflight;
pub(crate) mod readiness;
pub(crate) mod reconnect;

use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

pub use app_config::{AppConfig, load_config};
pub use backends::ConnectionConfig;
pub use config::{BatchConfig, BatchMode, ConsistencyLevel, ReadinessConfig};
pub use engine::{AddedObject, BatchClient, EngineState, PauseReason};
pub use error::BatchError;
pub use progress::IngestSummary;
pub use records::{InsertionIndex, NewObject, NewReference, Vectors};
pub use results::{BatchResults, ErrorRecord};

use progress::{EngineGauge, ProgressMetrics};
use source::{IngestLine, NdjsonSource};

const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// 🚀 Connect, ingest the configured source, close.
pub async fn run(app_config: AppConfig) -> anyhow::Result<IngestSummary> {
    let source = NdjsonSource::open(&app_config.source)?;
    let client = BatchClient::connect(&app_config.connection, app_config.batch.clone())
        .await
        .with_context(|| {
            format!(
                "💀 could not open the batch stream to {}",
                app_config.connection.grpc_url
            )
        })?;
    ingest(&client, source, &app_config.readiness).await
}

/// 📥 Feed every line of `source` through `client`, then close it.
///
/// Lines that fail validation are logged and counted, not fatal. Anything else the
/// engine raises stops the run.
pub async fn ingest(
    client: &BatchClient,
    source: NdjsonSource,
    readiness: &ReadinessConfig,
) -> anyhow::Result<IngestSummary> {
    let started = Instant::now();
    let mut progress = ProgressMetrics::new(source.name(), source.total_size());
    let (lines, reader) = source.spawn();

    let mut rejected = 0u64;
    let (mut unrendered_bytes, mut unrendered_records) = (0u64, 0u64);
    let mut last_render = Instant::now();
    let mut failure = None;
    while let Ok(line) = lines.recv().await {
        let added = match line.record {
            IngestLine::Object(object) => client.add_object(object).await.map(|_| ()),
            IngestLine::Reference(reference) => client.add_reference(reference).await.map(|_| ()),
        };
        match added {
            Ok(()) => unrendered_records += 1,
            Err(BatchError::Validation(message)) => {
                rejected += 1;
                warn!("🚫 line {} rejected: {}", line.line_number, message);
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
        unrendered_bytes += line.bytes;
        if last_render.elapsed() >= RENDER_INTERVAL {
            progress.update(unrendered_bytes, unrendered_records, gauge(client));
            (unrendered_bytes, unrendered_records) = (0, 0);
            last_render = Instant::now();
        }
    }
    // -- lets the reader thread notice, if we stopped early
    drop(lines);
    progress.update(unrendered_bytes, unrendered_records, gauge(client));

    if let Some(err) = failure {
        progress.finish();
        if let Err(close_err) = client.close().await {
            warn!("⚠️ closing after the failure failed too: {}", close_err);
        }
        return Err(err).context("💀 the batch engine gave up mid-ingest");
    }
    let stats = reader
        .await
        .context("💀 the source reader thread panicked")??;

    let closed = client.close().await;
    progress.update(0, 0, gauge(client));
    progress.finish();
    closed.context("💀 closing the batch engine failed")?;

    let indexed = if readiness.enabled {
        client
            .wait_for_vector_indexing(readiness)
            .await
            .context("💀 vector indexing never caught up")?;
        true
    } else {
        false
    };

    let summary = IngestSummary::new(
        stats,
        rejected,
        &client.results(),
        client.number_errors(),
        indexed,
        started.elapsed(),
    );
    info!(
        "🏁 ingest done: {} objects, {} references stored, {} failed, {} lines skipped",
        summary.objects_stored,
        summary.references_stored,
        summary.errors,
        summary.source.skipped + summary.rejected
    );
    Ok(summary)
}

fn gauge(client: &BatchClient) -> EngineGauge {
    EngineGauge {
        stored: client.number_successes(),
        failed: client.number_errors(),
        batch_size: client.batch_size(),
        streams: client.concurrency(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemoryServer, ServerScript};
    use std::io::Cursor;
    use uuid::Uuid;

    fn quick() -> BatchConfig {
        BatchConfig {
            mode: BatchMode::FixedSize {
                batch_size: 8,
                concurrency: 2,
            },
            linger_ms: 2,
            poll_interval_ms: 2,
            reconnect_base_delay_ms: 1,
            close_timeout_ms: 2_000,
            ..BatchConfig::default()
        }
    }

    fn ndjson(objects: usize) -> (String, Vec<Uuid>) {
        let uuids: Vec<Uuid> = (0..objects).map(|_| Uuid::new_v4()).collect();
        let mut lines: Vec<String> = uuids
            .iter()
            .enumerate()
            .map(|(n, uuid)| {
                format!(r#"{{"collection": "Article", "uuid": "{uuid}", "properties": {{"n": {n}}}}}"#)
            })
            .collect();
        lines.push(format!(
            r#"{{"from_collection": "Article", "from_uuid": "{}", "from_property": "next", "to": ["{}"]}}"#,
            uuids[0], uuids[1]
        ));
        lines.push(r#"{"collection": "not a valid name"}"#.to_string());
        lines.push("this is not json".to_string());
        (lines.join("\n"), uuids)
    }

    #[tokio::test]
    async fn the_one_where_a_dump_goes_all_the_way_in() {
        let server = InMemoryServer::new(ServerScript {
            shutdown_after_frames: Some(3),
            ..ServerScript::default()
        });
        let client = BatchClient::with_backends(quick(), server.connector(), server.cluster())
            .await
            .expect("connects");
        let (text, uuids) = ndjson(50);
        let source = NdjsonSource::from_reader("dump", 0, Cursor::new(text.into_bytes()), 16);
        let readiness = ReadinessConfig {
            enabled: true,
            poll_interval_ms: 1,
            ..ReadinessConfig::default()
        };

        let summary = ingest(&client, source, &readiness).await.expect("ingest");
        assert_eq!(summary.objects_stored, uuids.len() as u64);
        assert_eq!(summary.references_stored, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.source.skipped, 1);
        assert_eq!(summary.source.parsed, 52);
        assert!(summary.indexed);
        assert!(!summary.has_failures());
        assert_eq!(server.stored_objects().len(), uuids.len());
        assert_eq!(client.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn the_one_where_a_dead_server_stops_the_run() {
        let server = InMemoryServer::new(ServerScript {
            hang_up_after_frames: Some(1),
            refuse_connects_after: Some(2),
            ..ServerScript::default()
        });
        let config = BatchConfig {
            reconnect_attempts: 1,
            ..quick()
        };
        let client = BatchClient::with_backends(config, server.connector(), server.cluster())
            .await
            .expect("connects");
        let (text, _) = ndjson(500);
        let source = NdjsonSource::from_reader("dump", 0, Cursor::new(text.into_bytes()), 16);
        let err = ingest(&client, source, &ReadinessConfig::default())
            .await
            .unwrap_err();
        let root = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<BatchError>())
            .expect("a batch error underneath");
        assert!(matches!(root, BatchError::StreamReestablish { .. }));
        assert_eq!(client.state(), EngineState::Fatal);
    }
}
