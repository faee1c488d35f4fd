//! 📥 The receiver: everything the server says, and what we do about it.
//!
//! 🎬 *[the server says "Started". then "Acks". then "Results". then, at 3am,
//! "ShuttingDown". the receiver nods, takes notes, and calls the reconnection manager.]*
//!
//! Control signals (`Started`, `Backoff`, `ShuttingDown`, `Shutdown`, failures, end of
//! stream) only count when they come from the current generation. Data signals
//! (`Acks`, `Results`, `OutOfMemory`) are applied whenever they arrive: a result is a
//! result, even if the stream that carried it is gone.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::Worker;
use crate::classifier::ErrorClass;
use crate::engine::{EngineShared, EngineState, PauseReason};
use crate::error::BatchError;
use crate::inflight::Release;
use crate::protocol::{ControlSignal, Target, TargetError};
use crate::records::Record;
use crate::transport::{StreamEvent, StreamEventKind};

/// 🧊 Longest rate-limit cooldown, as a multiple of the configured base.
const MAX_COOLDOWN_FACTOR: u32 = 32;

/// 🔇 Results with errors are logged record by record up to `cap`, in aggregate after.
#[derive(Debug)]
struct ErrorLogBudget {
    cap: usize,
    spent: usize,
}

impl ErrorLogBudget {
    fn new(cap: usize) -> Self {
        Self { cap, spent: 0 }
    }

    /// Count one result that carried errors. True while it still gets detailed logs.
    fn spend(&mut self) -> bool {
        self.spent += 1;
        if self.spent == self.cap + 1 {
            warn!(
                "🔇 {} results with errors so far, only aggregates are logged from here",
                self.cap
            );
        }
        self.spent <= self.cap
    }
}

#[derive(Debug)]
pub(crate) struct ReceiverWorker {
    shared: Arc<EngineShared>,
    events: async_channel::Receiver<StreamEvent>,
    log_budget: ErrorLogBudget,
    ended: HashSet<(u64, usize)>,
}

impl ReceiverWorker {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        let events = shared.transport.events();
        let log_budget = ErrorLogBudget::new(shared.config.error_log_cap);
        Self {
            shared,
            events,
            log_budget,
            ended: HashSet::new(),
        }
    }

    /// 🏁 Stop was sent and every stream of the current generation has closed.
    fn finished(&self) -> bool {
        if !self.shared.sender_done.load(Ordering::SeqCst) {
            return false;
        }
        let generation = self.shared.transport.generation();
        let ended = self
            .ended
            .iter()
            .filter(|(born, _)| *born == generation)
            .count();
        ended >= self.shared.transport.stream_count()
    }

    async fn run(mut self) -> Result<(), BatchError> {
        let poll = self.shared.config.poll_interval();
        debug!("📥 receiver started");
        loop {
            self.shared.check_fatal()?;
            if self.finished() {
                info!("🏁 receiver finished, every stream closed");
                return Ok(());
            }
            let event = match tokio::time::timeout(poll, self.events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => return Ok(()),
                Err(_) => continue,
            };
            self.handle(event).await?;
        }
    }

    async fn handle(&mut self, event: StreamEvent) -> Result<(), BatchError> {
        let shared = self.shared.clone();
        let current = event.generation == shared.transport.generation();
        match event.kind {
            StreamEventKind::Signal(ControlSignal::Acks { uuids, beacons }) => {
                let acked = uuids
                    .into_iter()
                    .map(Target::Uuid)
                    .chain(beacons.into_iter().map(Target::Beacon))
                    .filter(|target| shared.inflight.acknowledge(target))
                    .count();
                trace!("📬 {} records acknowledged", acked);
                shared.gate.clear_oom();
            }
            StreamEventKind::Signal(ControlSignal::Results { successes, errors }) => {
                self.on_results(successes, errors);
            }
            StreamEventKind::Signal(ControlSignal::OutOfMemory { uuids, beacons }) => {
                let requeued: Vec<Record> = uuids
                    .into_iter()
                    .map(Target::Uuid)
                    .chain(beacons.into_iter().map(Target::Beacon))
                    .filter_map(|target| shared.inflight.take(&target, Release::Requeued))
                    .collect();
                warn!(
                    "🧠 server is out of memory, {} records go back to the queue",
                    requeued.len()
                );
                shared.queue.prepend(requeued);
                shared.gate.enter_oom();
                shared.set_state(EngineState::Paused(PauseReason::OutOfMemory));
            }
            _ if !current => {
                trace!(
                    "👻 ignoring a control event from generation {} (now {})",
                    event.generation,
                    shared.transport.generation()
                );
            }
            StreamEventKind::Signal(ControlSignal::Started) => {
                debug!("🟢 stream {} started", event.stream_id);
                shared.gate.mark_started();
                shared.gate.clear_oom();
                shared.set_state(EngineState::Running);
            }
            StreamEventKind::Signal(ControlSignal::Backoff { batch_size }) => {
                if shared.gate.is_shutting_down() {
                    debug!("🧯 ignoring backoff from a server on its way out");
                } else {
                    shared.admission.apply_backoff(batch_size, shared.is_stopping());
                }
                shared.gate.clear_oom();
            }
            StreamEventKind::Signal(ControlSignal::ShuttingDown) => {
                info!("👋 server is shutting down, pausing sends");
                shared.gate.set_shutting_down(true);
                shared.set_state(EngineState::Paused(PauseReason::ShuttingDown));
            }
            StreamEventKind::Signal(ControlSignal::Shutdown) => {
                self.reconnect(event.generation, event.stream_id, "server shut down").await?;
            }
            StreamEventKind::Failed(err) if err.is_recoverable() => {
                self.reconnect(event.generation, event.stream_id, &err.to_string()).await?;
            }
            StreamEventKind::Failed(err) => {
                error!("💀 stream {} failed: {}", event.stream_id, err);
                return Err(shared.fail(BatchError::Transport(err.to_string())));
            }
            StreamEventKind::Ended => {
                if shared.sender_done.load(Ordering::SeqCst) {
                    debug!("🏁 stream {} closed after stop", event.stream_id);
                    self.ended.insert((event.generation, event.stream_id));
                } else {
                    self.reconnect(event.generation, event.stream_id, "stream ended unexpectedly").await?;
                }
            }
        }
        Ok(())
    }

    async fn reconnect(
        &mut self,
        generation: u64,
        stream_id: usize,
        reason: &str,
    ) -> Result<(), BatchError> {
        let shared = self.shared.clone();
        if shared.is_stopping() && shared.outstanding() == 0 {
            debug!("🏁 {} while stopping with nothing outstanding, letting it go", reason);
            self.ended.insert((generation, stream_id));
            return Ok(());
        }
        if let Err(err) = shared
            .reconnect
            .reestablish(&shared, generation, reason)
            .await
        {
            error!("💀 {}", err);
            return Err(shared.fail(err));
        }
        Ok(())
    }

    fn on_results(&mut self, successes: Vec<Target>, errors: Vec<TargetError>) {
        let shared = self.shared.clone();
        let mut resolved = 0u64;
        for target in successes {
            match shared.inflight.take(&target, Release::Resolved) {
                Some(Record::Object(object)) => {
                    shared.results.object_succeeded(&object);
                    resolved += 1;
                }
                Some(Record::Reference(reference)) => {
                    shared.results.reference_succeeded(&reference);
                    resolved += 1;
                }
                None => trace!("🤷 success for a record we no longer track: {:?}", target),
            }
        }

        let detailed = errors.is_empty() || self.log_budget.spend();
        if !detailed {
            warn!("⚠️ {} records failed in one result", errors.len());
        }

        for TargetError { target, message } in errors {
            let Some(mut record) = shared.inflight.take(&target, Release::Requeued) else {
                trace!("🤷 error for a record we no longer track: {:?}", target);
                continue;
            };
            let retryable = matches!(
                shared.classifier.classify(&message),
                ErrorClass::RateLimited { .. }
            );
            if retryable && record.retries() < shared.config.max_retries {
                let retries = record.bump_retries();
                let factor = 2u32.saturating_pow(retries - 1).min(MAX_COOLDOWN_FACTOR);
                let cooldown = shared.config.rate_limit_cooldown() * factor;
                if detailed {
                    warn!(
                        "🐢 rate limited (attempt {}), retrying in {:?}: {}",
                        retries, cooldown, message
                    );
                }
                shared.gate.cool_down(cooldown);
                shared.queue.prepend(vec![record]);
                continue;
            }
            if detailed {
                warn!("❌ record {:?} failed: {}", target, message);
            }
            match record {
                Record::Object(object) => {
                    shared.inflight.release(&object.uuid);
                    shared.results.object_failed(object, message);
                }
                Record::Reference(reference) => shared.results.reference_failed(reference, message),
            }
            resolved += 1;
        }
        if resolved > 0 {
            shared.resolved(resolved);
        }
    }
}

impl Worker for ReceiverWorker {
    fn start(self) -> JoinHandle<Result<(), BatchError>> {
        tokio::spawn(self.run())
    }
}
