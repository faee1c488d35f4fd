//! 🚂 The engine: [`BatchClient`], the one thing callers actually hold.
//!
//! 🎬 *[a caller adds an object. it returns instantly. somewhere behind the curtain, a
//! queue grows, a sender lingers, a stream hums, a server acks, a receiver files the
//! paperwork. the caller never finds out how close it came to a reconnect.]*
//!
//! `add_object` and `add_reference` validate, wait for admission, stamp an insertion
//! index and queue. The sender and receiver workers do everything else in the
//! background. `flush` waits until every record has a final outcome. `close` flushes,
//! says `Stop` on every stream and joins the workers.
//!
//! A failure in the background (a stream that can't be re-established, a server out of
//! memory for too long) is stored and handed back by the next caller operation.
//!
//! State machine:
//! `Idle -> Started -> Running <-> Paused -> Draining -> Stopped`, with
//! `Running | Paused -> Reconnecting -> Running | Fatal`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::backends::grpc::GrpcConnector;
use crate::backends::rest::RestCluster;
use crate::backends::{ClusterBackend, ConnectionConfig, ConnectorBackend};
use crate::classifier::RetryClassifier;
use crate::config::{BatchConfig, BatchMode, ReadinessConfig};
use crate::dispatch::receiver::ReceiverWorker;
use crate::dispatch::sender::SenderWorker;
use crate::dispatch::ticker::AdmissionTicker;
use crate::dispatch::{SendGate, Worker};
use crate::error::BatchError;
use crate::inflight::InFlight;
use crate::queue::RecordQueue;
use crate::readiness::ReadinessPoller;
use crate::reconnect::ReconnectionManager;
use crate::records::{
    InsertionIndex, NewObject, NewReference, PendingObject, PendingReference, Record, Shard,
    fan_out,
};
use crate::results::{BatchResults, ErrorRecord, ResultAggregator};
use crate::transport::StreamTransport;

/// ⏸️ Why sending is on hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    OutOfMemory,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// 📡 Streams are open, waiting for the server's `Started`.
    Started,
    Running,
    Paused(PauseReason),
    Reconnecting,
    /// 🏁 `close` is flushing and stopping.
    Draining,
    Stopped,
    Fatal,
}

/// 🆔 Where an added object ended up: its place in line and its (maybe generated) UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedObject {
    pub index: InsertionIndex,
    pub uuid: Uuid,
}

/// 🧠 Everything the caller-facing client and the background workers share.
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub(crate) config: BatchConfig,
    pub(crate) queue: RecordQueue,
    pub(crate) admission: AdmissionController,
    pub(crate) inflight: InFlight,
    pub(crate) results: ResultAggregator,
    pub(crate) transport: StreamTransport,
    pub(crate) cluster: ClusterBackend,
    pub(crate) classifier: RetryClassifier,
    pub(crate) reconnect: ReconnectionManager,
    pub(crate) gate: SendGate,
    pub(crate) stopping: AtomicBool,
    pub(crate) sender_done: AtomicBool,
    pub(crate) flushing: AtomicUsize,
    state: Mutex<EngineState>,
    fatal: Mutex<Option<BatchError>>,
    next_index: AtomicU64,
    /// 🔢 Added but without a final outcome yet. Retries and replays don't change it.
    outstanding: AtomicU64,
    progress: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineShared {
    fn new(
        config: BatchConfig,
        connector: ConnectorBackend,
        cluster: ClusterBackend,
    ) -> Result<Self, BatchError> {
        let classifier = RetryClassifier::new(&config.retryable_errors).map_err(|err| {
            BatchError::Validation(format!("invalid retryable error pattern: {err}"))
        })?;
        Ok(Self {
            queue: RecordQueue::new(),
            admission: AdmissionController::new(&config),
            inflight: InFlight::new(),
            results: ResultAggregator::new(config.max_result_history),
            transport: StreamTransport::new(connector, config.consistency_level),
            cluster,
            classifier,
            reconnect: ReconnectionManager::new(),
            gate: SendGate::new(),
            stopping: AtomicBool::new(false),
            sender_done: AtomicBool::new(false),
            flushing: AtomicUsize::new(0),
            state: Mutex::new(EngineState::Idle),
            fatal: Mutex::new(None),
            next_index: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
            progress: Notify::new(),
            config,
        })
    }

    pub(crate) fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    /// 🔀 Move the state machine. `Fatal` and `Stopped` are final, `Draining` only
    /// gives way to them.
    pub(crate) fn set_state(&self, next: EngineState) {
        let mut state = lock(&self.state);
        let allowed = match *state {
            EngineState::Fatal | EngineState::Stopped => false,
            EngineState::Draining => matches!(next, EngineState::Fatal | EngineState::Stopped),
            _ => true,
        };
        if allowed && *state != next {
            debug!("🔀 engine {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// 💀 Record a background failure. The first one wins and is what callers see.
    pub(crate) fn fail(&self, err: BatchError) -> BatchError {
        let stored = lock(&self.fatal).get_or_insert(err).clone();
        self.set_state(EngineState::Fatal);
        self.progress.notify_waiters();
        stored
    }

    pub(crate) fn check_fatal(&self) -> Result<(), BatchError> {
        match lock(&self.fatal).as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// ✅ `count` records reached a final outcome.
    pub(crate) fn resolved(&self, count: u64) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
        self.progress.notify_waiters();
    }

    fn next_index(&self) -> InsertionIndex {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Workers {
    sender: JoinHandle<Result<(), BatchError>>,
    receiver: JoinHandle<Result<(), BatchError>>,
    ticker: Option<JoinHandle<Result<(), BatchError>>>,
}

impl Workers {
    fn abort_all(self) {
        self.sender.abort();
        self.receiver.abort();
        if let Some(ticker) = self.ticker {
            ticker.abort();
        }
    }
}

/// 🔻 Keeps the sender from lingering while somebody is waiting on a flush.
struct FlushGuard<'a>(&'a AtomicUsize);

impl<'a> FlushGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 🚂 The async batch client.
///
/// Cheap to share behind an `Arc`: every method takes `&self`, so many producers can add
/// at once while one sender and one receiver work in the background.
#[derive(Debug)]
pub struct BatchClient {
    shared: Arc<EngineShared>,
    workers: Mutex<Option<Workers>>,
}

impl BatchClient {
    /// 🔌 gRPC for the stream, REST for everything else.
    pub async fn connect(connection: &ConnectionConfig, config: BatchConfig) -> anyhow::Result<Self> {
        let connector = ConnectorBackend::Grpc(GrpcConnector::new(connection)?);
        let cluster = ClusterBackend::Rest(RestCluster::new(connection)?);
        Ok(Self::with_backends(config, connector, cluster).await?)
    }

    /// 🧩 Bring your own backends. Opens the first generation of streams (with the same
    /// retry budget a reconnect gets) and starts the workers.
    pub async fn with_backends(
        config: BatchConfig,
        connector: ConnectorBackend,
        cluster: ClusterBackend,
    ) -> Result<Self, BatchError> {
        let shared = Arc::new(EngineShared::new(config, connector, cluster)?);
        shared.reconnect.establish(&shared, true).await?;
        shared.set_state(EngineState::Started);

        let sender = SenderWorker::new(shared.clone()).start();
        let receiver = ReceiverWorker::new(shared.clone()).start();
        let ticker = (shared.config.mode == BatchMode::Dynamic)
            .then(|| AdmissionTicker::new(shared.clone()).start());
        info!(
            "🚂 batch engine up: {:?} mode, batch size {}, {} streams",
            shared.config.mode,
            shared.admission.batch_size(),
            shared.admission.concurrency()
        );
        Ok(Self {
            shared,
            workers: Mutex::new(Some(Workers {
                sender,
                receiver,
                ticker,
            })),
        })
    }

    fn ensure_accepting(&self) -> Result<(), BatchError> {
        self.shared.check_fatal()?;
        if self.shared.is_stopping() || lock(&self.workers).is_none() {
            return Err(BatchError::Closed);
        }
        Ok(())
    }

    /// 🚧 Wait while the batch size is zero or too much is in flight.
    async fn admit(&self) -> Result<(), BatchError> {
        let shared = &self.shared;
        let poll = shared.config.poll_interval();
        loop {
            shared.check_fatal()?;
            if shared.is_stopping() {
                return Err(BatchError::Closed);
            }
            let size = shared.admission.batch_size();
            if size == 0 {
                let _ = tokio::time::timeout(poll, shared.admission.wait_until_open()).await;
                continue;
            }
            if shared.inflight.unacked_count() < (2 * size).max(1) {
                return Ok(());
            }
            shared.inflight.wait_for_change(poll).await;
        }
    }

    /// ➕ Queue one object, plus one reference per target in its `references`.
    pub async fn add_object(&self, object: NewObject) -> Result<AddedObject, BatchError> {
        self.ensure_accepting()?;
        object.validate()?;
        self.admit().await?;

        let shared = &self.shared;
        let pending = object.into_pending(shared.next_index());
        let added = AddedObject {
            index: pending.index,
            uuid: pending.uuid,
        };
        let references: Vec<PendingReference> = pending
            .references
            .iter()
            .flat_map(|(property, targets)| {
                let reference = NewReference {
                    from_collection: pending.collection.clone(),
                    from_uuid: pending.uuid,
                    from_property: property.clone(),
                    to: targets.clone(),
                    to_collection: None,
                    tenant: pending.tenant.clone(),
                };
                fan_out(reference, || shared.next_index())
            })
            .collect();

        shared.results.touch_shard(pending.shard());
        shared.inflight.exclude(pending.uuid);
        shared
            .outstanding
            .fetch_add(1 + references.len() as u64, Ordering::SeqCst);
        shared.queue.extend(
            std::iter::once(Record::Object(pending))
                .chain(references.into_iter().map(Record::Reference)),
        );
        Ok(added)
    }

    /// 🔗 Queue a reference. One insertion index per target, in target order.
    pub async fn add_reference(
        &self,
        reference: NewReference,
    ) -> Result<Vec<InsertionIndex>, BatchError> {
        self.ensure_accepting()?;
        reference.validate()?;
        self.admit().await?;

        let shared = &self.shared;
        let references = fan_out(reference, || shared.next_index());
        let indices = references.iter().map(|reference| reference.index).collect();
        if let Some(first) = references.first() {
            shared.results.touch_shard(first.shard());
        }
        shared
            .outstanding
            .fetch_add(references.len() as u64, Ordering::SeqCst);
        shared
            .queue
            .extend(references.into_iter().map(Record::Reference));
        Ok(indices)
    }

    /// 🚿 Wait until every added record has a final outcome. Cheap when there is nothing
    /// to wait for.
    pub async fn flush(&self) -> Result<(), BatchError> {
        let shared = &self.shared;
        shared.check_fatal()?;
        let _flushing = FlushGuard::enter(&shared.flushing);
        let poll = shared.config.poll_interval();
        loop {
            shared.check_fatal()?;
            if shared.outstanding() == 0 {
                return Ok(());
            }
            let _ = tokio::time::timeout(poll, shared.progress.notified()).await;
        }
    }

    /// 🏁 Flush, send `Stop`, join the workers. Calling it again is harmless.
    pub async fn close(&self) -> Result<(), BatchError> {
        let Some(workers) = lock(&self.workers).take() else {
            return self.shared.check_fatal();
        };
        let shared = &self.shared;
        let flushed = self.flush().await;
        shared.set_state(EngineState::Draining);
        shared.stopping.store(true, Ordering::SeqCst);

        let timeout = shared.config.close_timeout();
        let Workers {
            sender,
            receiver,
            ticker,
        } = workers;
        join_worker("sender", sender, timeout).await;
        join_worker("receiver", receiver, timeout).await;
        if let Some(ticker) = ticker {
            join_worker("admission ticker", ticker, timeout).await;
        }
        shared.transport.teardown();
        shared.set_state(EngineState::Stopped);

        let results = shared.results.snapshot();
        info!(
            "🏁 batch closed: {} objects and {} references stored, {} errors, {:?}",
            results.objects.total_successes(),
            results.references.total_successes(),
            shared.results.number_errors(),
            results.objects.elapsed
        );
        flushed.and(shared.check_fatal())
    }

    /// 🔁 Re-submit every object that failed for good. They get new insertion indices.
    pub async fn retry_failed_objects(&self) -> Result<Vec<AddedObject>, BatchError> {
        let failed = self.shared.results.take_failed_objects();
        let mut added = Vec::with_capacity(failed.len());
        for failure in failed {
            added.push(self.add_object(failure.record.to_new_object()).await?);
        }
        Ok(added)
    }

    /// 🔁 Re-submit every reference that failed for good.
    pub async fn retry_failed_references(&self) -> Result<Vec<InsertionIndex>, BatchError> {
        let failed = self.shared.results.take_failed_references();
        let mut indices = Vec::with_capacity(failed.len());
        for failure in failed {
            indices.extend(self.add_reference(failure.record.to_new_reference()).await?);
        }
        Ok(indices)
    }

    /// ⏳ Wait for the server to finish vector indexing on every shard we touched.
    pub async fn wait_for_vector_indexing(&self, config: &ReadinessConfig) -> Result<(), BatchError> {
        self.shared.check_fatal()?;
        let shards = self.shared.results.touched_shards();
        ReadinessPoller::new(&self.shared.cluster, config)
            .wait_for(&shards)
            .await
    }

    pub fn results(&self) -> BatchResults {
        self.shared.results.snapshot()
    }

    pub fn failed_objects(&self) -> Vec<ErrorRecord<PendingObject>> {
        self.shared.results.failed_objects()
    }

    pub fn failed_references(&self) -> Vec<ErrorRecord<PendingReference>> {
        self.shared.results.failed_references()
    }

    /// 🔢 Lifetime count of records that failed for good.
    pub fn number_errors(&self) -> u64 {
        self.shared.results.number_errors()
    }

    /// 🔢 Lifetime count of records stored.
    pub fn number_successes(&self) -> u64 {
        self.shared.results.number_successes()
    }

    pub fn touched_shards(&self) -> Vec<Shard> {
        self.shared.results.touched_shards()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// 🔢 Records added that don't have a final outcome yet.
    pub fn outstanding(&self) -> u64 {
        self.shared.outstanding()
    }

    pub fn batch_size(&self) -> usize {
        self.shared.admission.batch_size()
    }

    pub fn concurrency(&self) -> usize {
        self.shared.admission.concurrency()
    }
}

async fn join_worker(
    name: &str,
    mut handle: JoinHandle<Result<(), BatchError>>,
    timeout: std::time::Duration,
) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => debug!("🧵 {} joined", name),
        Ok(Ok(Err(err))) => debug!("🧵 {} stopped with: {}", name, err),
        Ok(Err(join_err)) => error!("💀 {} panicked or was cancelled: {}", name, join_err),
        Err(_) => {
            warn!("⏰ {} did not stop within {:?}, aborting it", name, timeout);
            handle.abort();
        }
    }
}

impl Drop for BatchClient {
    fn drop(&mut self) {
        if let Some(workers) = lock(&self.workers).take() {
            debug!("🧹 batch client dropped without close, aborting workers");
            workers.abort_all();
            self.shared.transport.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemoryServer, ServerScript};
    use crate::backends::{BatchStats, NodeStatus};
    use crate::config::ConsistencyLevel;
    use std::time::Duration;

    fn quick() -> BatchConfig {
        BatchConfig {
            mode: BatchMode::FixedSize {
                batch_size: 10,
                concurrency: 2,
            },
            linger_ms: 5,
            poll_interval_ms: 2,
            reconnect_base_delay_ms: 1,
            rate_limit_cooldown_ms: 1,
            close_timeout_ms: 2_000,
            ..BatchConfig::default()
        }
    }

    async fn client(server: &InMemoryServer, config: BatchConfig) -> BatchClient {
        BatchClient::with_backends(config, server.connector(), server.cluster())
            .await
            .expect("in-memory server accepts the connection")
    }

    fn article(n: usize) -> NewObject {
        NewObject::new("Article").with_property("n", n as u64)
    }

    async fn flush_in_time(client: &BatchClient) -> Result<(), BatchError> {
        tokio::time::timeout(Duration::from_secs(10), client.flush())
            .await
            .expect("flush finishes in time")
    }

    async fn add_articles(client: &BatchClient, count: usize) -> Vec<AddedObject> {
        let mut added = Vec::with_capacity(count);
        for n in 0..count {
            added.push(client.add_object(article(n)).await.expect("valid object"));
        }
        added
    }

    #[tokio::test]
    async fn the_one_where_everything_just_works() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let added = add_articles(&client, 25).await;
        assert_eq!(
            added.iter().map(|a| a.index).collect::<Vec<_>>(),
            (0..25).collect::<Vec<_>>()
        );

        flush_in_time(&client).await.expect("flush");
        let results = client.results();
        assert_eq!(results.objects.total_successes(), 25);
        assert!(results.objects.failures.is_empty());
        assert!(!results.has_errors());
        assert_eq!(server.stored_objects().len(), 25);
        assert_eq!(client.outstanding(), 0);
        assert_eq!(client.number_successes(), 25);

        client.close().await.expect("clean close");
        assert_eq!(client.state(), EngineState::Stopped);
        assert!(server.connects() >= 2, "two streams in fixed mode");
    }

    #[tokio::test]
    async fn the_one_where_references_wait_for_their_objects() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let author = client
            .add_object(NewObject::new("Person").with_property("name", "Ada"))
            .await
            .expect("person");
        let paper = client
            .add_object(
                NewObject::new("Paper")
                    .with_property("title", "Notes")
                    .with_reference("writtenBy", author.uuid),
            )
            .await
            .expect("paper");
        assert_eq!(paper.index, 1);
        let indices = client
            .add_reference(
                NewReference::new("Person", author.uuid, "wrote", paper.uuid)
                    .with_to_collection("Paper"),
            )
            .await
            .expect("reference");
        assert_eq!(indices, vec![3], "index 2 went to the paper's own reference");

        flush_in_time(&client).await.expect("flush");
        let results = client.results();
        assert_eq!(results.objects.total_successes(), 2);
        assert_eq!(results.references.total_successes(), 2);
        assert_eq!(server.stored_references().len(), 2);
        let shards: Vec<String> = client
            .touched_shards()
            .into_iter()
            .map(|shard| shard.collection)
            .collect();
        assert_eq!(shards, vec!["Paper".to_string(), "Person".to_string()]);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_a_bad_name_never_reaches_the_queue() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let err = client
            .add_object(NewObject::new("123 Main St"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));
        let err = client
            .add_object(NewObject::new("Article").with_property("_id", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));
        assert_eq!(client.outstanding(), 0);
        flush_in_time(&client).await.expect("nothing to flush");
        client.close().await.expect("close");
        assert_eq!(server.frames(), 0);
    }

    #[tokio::test]
    async fn the_one_where_the_server_restarts_mid_batch() {
        let server = InMemoryServer::new(ServerScript {
            shutdown_after_frames: Some(1),
            ..ServerScript::default()
        });
        let client = client(&server, quick()).await;
        let added = add_articles(&client, 30).await;
        flush_in_time(&client).await.expect("flush survives the restart");

        let results = client.results();
        assert_eq!(results.objects.total_successes(), 30);
        assert_eq!(results.objects.total_failures(), 0);
        assert_eq!(server.stored_objects().len(), 30);
        for object in &added {
            assert!(results.objects.successes.contains_key(&object.index));
            let sent = server.received_count(&object.uuid.to_string());
            assert!(
                (1..=2).contains(&sent),
                "{} went out {} times, a replay resends at most once",
                object.uuid,
                sent
            );
        }
        assert!(server.connects() >= 4, "a second generation was opened");
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_a_pause_lands_while_the_sender_lingers() {
        let server = InMemoryServer::default();
        let config = BatchConfig {
            mode: BatchMode::FixedSize {
                batch_size: 100,
                concurrency: 1,
            },
            linger_ms: 150,
            ..quick()
        };
        let client = client(&server, config).await;
        while client.state() != EngineState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        add_articles(&client, 5).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.shared.gate.set_shutting_down(true);

        // -- well past the linger deadline
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(server.frames(), 0, "nothing goes out once the server is leaving");
        assert_eq!(client.shared.queue.len(), 5);
        assert_eq!(client.shared.inflight.len(), 0);

        client.shared.gate.set_shutting_down(false);
        flush_in_time(&client).await.expect("flush once the gate reopens");
        assert_eq!(server.stored_objects().len(), 5);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_a_rate_limit_and_a_shutdown_share_one_batch() {
        let server = InMemoryServer::new(ServerScript {
            shutdown_after_frames: Some(2),
            ..ServerScript::default()
        });
        let mut config = quick();
        config.mode = BatchMode::FixedSize {
            batch_size: 10,
            concurrency: 1,
        };
        let client = client(&server, config).await;
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        server.fail(c.to_string(), "Rate limit reached for requests", 1);
        for (n, uuid) in [a, b, c].into_iter().enumerate() {
            client
                .add_object(article(n).with_uuid(uuid))
                .await
                .expect("object");
        }
        let indices = client
            .add_reference(NewReference::new("Article", a, "related", b))
            .await
            .expect("reference");
        assert_eq!(indices, vec![3]);
        let beacon = format!("Article/{a}/related/{b}");

        flush_in_time(&client).await.expect("flush survives it all");
        let results = client.results();
        assert_eq!(results.objects.total_successes(), 3);
        assert_eq!(results.references.total_successes(), 1);
        assert_eq!(client.number_errors(), 0);
        assert_eq!(server.stored_objects().len(), 3);
        assert_eq!(server.stored_references(), vec![beacon.clone()]);

        assert_eq!(server.received_count(&a.to_string()), 1, "acked before the reference left");
        assert!(server.received_count(&c.to_string()) >= 2, "rate limited once, then retried");
        let reference_sends = server.received_count(&beacon);
        assert!(
            (1..=2).contains(&reference_sends),
            "the reference is replayed at most once, went out {reference_sends} times"
        );
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_the_line_drops_and_comes_back() {
        let server = InMemoryServer::new(ServerScript {
            hang_up_after_frames: Some(2),
            ..ServerScript::default()
        });
        let client = client(&server, quick()).await;
        add_articles(&client, 40).await;
        flush_in_time(&client).await.expect("flush survives the hang-up");
        assert_eq!(client.results().objects.total_successes(), 40);
        assert_eq!(server.stored_objects().len(), 40);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_the_server_runs_out_of_memory_and_recovers() {
        let server = InMemoryServer::new(ServerScript {
            oom_after_frames: Some(1),
            ..ServerScript::default()
        });
        let client = client(&server, quick()).await;
        add_articles(&client, 20).await;
        flush_in_time(&client).await.expect("flush survives the OOM");
        assert_eq!(client.results().objects.total_successes(), 20);
        assert_eq!(server.stored_objects().len(), 20);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_the_server_stays_out_of_memory() {
        let server = InMemoryServer::default();
        let mut config = quick();
        config.mode = BatchMode::FixedSize {
            batch_size: 10,
            concurrency: 1,
        };
        config.oom_timeout_ms = 0;
        let client = client(&server, config).await;
        while client.state() != EngineState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        client.shared.gate.enter_oom();
        let err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(err) = client.shared.check_fatal() {
                    return err;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("the sender gives up");
        assert_eq!(err, BatchError::OutOfMemoryTimeout(Duration::ZERO));
        assert_eq!(client.add_object(article(0)).await.unwrap_err(), err);
        assert_eq!(client.close().await.unwrap_err(), err);
        assert_eq!(client.state(), EngineState::Fatal);
    }

    #[tokio::test]
    async fn the_one_where_rate_limits_are_waited_out() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let uuid = Uuid::new_v4();
        server.fail(
            uuid.to_string(),
            "Rate limit reached for requests, please try again in 20ms",
            2,
        );
        let added = client
            .add_object(article(0).with_uuid(uuid))
            .await
            .expect("object");
        flush_in_time(&client).await.expect("flush");
        let results = client.results();
        assert_eq!(results.objects.successes.get(&added.index), Some(&uuid));
        assert_eq!(client.number_errors(), 0);
        assert_eq!(server.received_count(&uuid.to_string()), 3);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_patience_runs_out_after_max_retries() {
        let server = InMemoryServer::default();
        let mut config = quick();
        config.max_retries = 2;
        let client = client(&server, config).await;
        let uuid = Uuid::new_v4();
        server.fail(uuid.to_string(), "429 Too Many Requests", 10);
        client
            .add_object(article(0).with_uuid(uuid))
            .await
            .expect("object");
        flush_in_time(&client).await.expect("flush");
        let failed = client.failed_objects();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retries, 2);
        assert_eq!(failed[0].record.uuid, uuid);
        client.close().await.expect("partial failures are not errors");
    }

    #[tokio::test]
    async fn the_one_where_a_terminal_error_is_data_and_can_be_retried() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let uuid = Uuid::new_v4();
        server.fail(uuid.to_string(), "invalid property 'n': wrong type", 1);
        client
            .add_object(article(0).with_uuid(uuid))
            .await
            .expect("object");
        client.add_object(article(1)).await.expect("object");
        flush_in_time(&client).await.expect("flush");

        assert_eq!(client.number_errors(), 1);
        assert!(client.results().has_errors());
        let failed = client.failed_objects();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retries, 0, "not a rate limit, no retries");

        let retried = client.retry_failed_objects().await.expect("retry");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].uuid, uuid);
        assert_eq!(retried[0].index, 2, "retries get new indices");
        flush_in_time(&client).await.expect("flush");
        assert!(client.failed_objects().is_empty());
        assert_eq!(client.number_errors(), 1, "lifetime count remembers");
        assert_eq!(server.stored_objects().len(), 2);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_failed_references_get_a_second_chance() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let (from, to) = (Uuid::new_v4(), Uuid::new_v4());
        let reference = NewReference::new("Article", from, "cites", to);
        let beacon = format!("Article/{from}/cites/{to}");
        server.fail(beacon.clone(), "target object not found", 1);
        client.add_reference(reference).await.expect("reference");
        flush_in_time(&client).await.expect("flush");
        assert_eq!(client.failed_references().len(), 1);

        let indices = client.retry_failed_references().await.expect("retry");
        assert_eq!(indices.len(), 1);
        flush_in_time(&client).await.expect("flush");
        assert!(client.failed_references().is_empty());
        assert_eq!(server.stored_references(), vec![beacon]);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_a_zero_backoff_holds_the_door() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        while client.state() != EngineState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        server.broadcast_backoff(0);
        while client.batch_size() != 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), client.add_object(article(0))).await;
        assert!(blocked.is_err(), "nothing gets in while the batch size is zero");

        server.broadcast_backoff(5);
        tokio::time::timeout(Duration::from_secs(2), client.add_object(article(1)))
            .await
            .expect("admitted once the door opens")
            .expect("valid object");
        assert_eq!(client.batch_size(), 5);
        flush_in_time(&client).await.expect("flush");
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_results_arrive_without_acks() {
        let server = InMemoryServer::new(ServerScript {
            skip_acks: true,
            result_delay: Some(Duration::from_millis(30)),
            ..ServerScript::default()
        });
        let mut config = quick();
        config.mode = BatchMode::FixedSize {
            batch_size: 2,
            concurrency: 1,
        };
        let client = client(&server, config).await;
        add_articles(&client, 12).await;
        flush_in_time(&client).await.expect("flush");
        assert_eq!(client.results().objects.total_successes(), 12);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_flushing_nothing_is_instant() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_millis(100), client.flush())
                .await
                .expect("immediate")
                .expect("no error");
        }
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_closing_twice_is_fine_but_adding_after_is_not() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        add_articles(&client, 3).await;
        client.close().await.expect("first close flushes");
        assert_eq!(server.stored_objects().len(), 3);
        client.close().await.expect("second close is a no-op");
        assert_eq!(
            client.add_object(article(9)).await.unwrap_err(),
            BatchError::Closed
        );
    }

    #[tokio::test]
    async fn the_one_where_the_server_never_comes_back() {
        let server = InMemoryServer::new(ServerScript {
            shutdown_after_frames: Some(1),
            refuse_connects_after: Some(2),
            ..ServerScript::default()
        });
        let mut config = quick();
        config.reconnect_attempts = 2;
        let client = client(&server, config).await;
        add_articles(&client, 15).await;
        let err = flush_in_time(&client).await.unwrap_err();
        assert!(
            matches!(err, BatchError::StreamReestablish { attempts: 2, .. }),
            "unexpected error: {err}"
        );
        assert_eq!(client.close().await.unwrap_err(), err);
        assert_eq!(client.state(), EngineState::Fatal);
    }

    #[tokio::test]
    async fn the_one_where_the_first_knock_is_ignored() {
        let server = InMemoryServer::new(ServerScript {
            refuse_connects: 1,
            ..ServerScript::default()
        });
        let client = client(&server, quick()).await;
        add_articles(&client, 5).await;
        flush_in_time(&client).await.expect("flush");
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_strict_consistency_waits_for_a_healthy_cluster() {
        let server = InMemoryServer::default();
        server.push_nodes_response(Ok(vec![NodeStatus {
            name: "node-1".into(),
            status: "UNHEALTHY".into(),
            batch_stats: None,
        }]));
        let mut config = quick();
        config.consistency_level = ConsistencyLevel::All;
        let client = client(&server, config).await;
        assert_eq!(client.state(), EngineState::Started);
        add_articles(&client, 2).await;
        flush_in_time(&client).await.expect("flush");
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_an_empty_server_queue_grows_the_batch() {
        let server = InMemoryServer::default();
        server.set_nodes(vec![NodeStatus {
            name: "node-1".into(),
            status: "HEALTHY".into(),
            batch_stats: Some(BatchStats {
                queue_length: 0,
                rate_per_second: 500.0,
            }),
        }]);
        let config = BatchConfig {
            admission_interval_ms: 5,
            ..quick()
        };
        let config = BatchConfig {
            mode: BatchMode::Dynamic,
            ..config
        };
        let client = client(&server, config).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.batch_size() <= 100 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the ticker grows the batch");
        add_articles(&client, 10).await;
        client.close().await.expect("close");
        assert_eq!(server.stored_objects().len(), 10);
    }

    #[tokio::test]
    async fn the_one_where_rate_limit_mode_still_delivers() {
        let server = InMemoryServer::default();
        let config = BatchConfig {
            mode: BatchMode::RateLimit {
                requests_per_minute: 600,
            },
            ..quick()
        };
        let client = client(&server, config).await;
        assert_eq!(client.concurrency(), 1);
        add_articles(&client, 7).await;
        flush_in_time(&client).await.expect("flush");
        assert_eq!(client.results().objects.total_successes(), 7);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn the_one_where_the_same_uuid_is_added_twice() {
        let server = InMemoryServer::default();
        let client = client(&server, quick()).await;
        let uuid = Uuid::new_v4();
        client.add_object(article(0).with_uuid(uuid)).await.expect("first");
        client.add_object(article(1).with_uuid(uuid)).await.expect("second");
        flush_in_time(&client).await.expect("flush");
        let results = client.results();
        assert_eq!(results.objects.total_successes(), 2);
        assert_eq!(results.objects.successes.len(), 2);
        client.close().await.expect("close");
    }
}
