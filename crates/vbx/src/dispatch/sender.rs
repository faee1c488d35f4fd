//! 📤 The sender: queue in, frames out.
//!
//! 🎬 *[the queue holds 37 records. the recommended batch is 100. the sender checks
//! its watch. it will wait one second. not a millisecond more.]*
//!
//! Each round: check the gate, linger for a fuller batch, pop with the exclusion set,
//! register as in flight, frame, send. A send that fails with a hang-up puts the unsent
//! records back at the front of the queue and leaves the reconnecting to the receiver,
//! which hears about the broken stream anyway.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::Worker;
use crate::config::BatchMode;
use crate::engine::EngineShared;
use crate::error::BatchError;
use crate::protocol::{BatchStreamRequest, batch_stream_request};
use crate::records::{InsertionIndex, Record};
use crate::transport::framing::frame_records;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// ⏲️ Rate-limit bookkeeping: how many records went out in the current minute.
#[derive(Debug)]
struct RateWindow {
    per_minute: usize,
    opened: Instant,
    sent: usize,
}

impl RateWindow {
    fn new(per_minute: usize) -> Self {
        Self {
            per_minute: per_minute.max(1),
            opened: Instant::now(),
            sent: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.opened) >= RATE_WINDOW {
            self.opened = now;
            self.sent = 0;
        }
    }

    fn allowance(&mut self) -> usize {
        self.roll(Instant::now());
        self.per_minute.saturating_sub(self.sent)
    }

    fn until_next_window(&self) -> Duration {
        RATE_WINDOW.saturating_sub(self.opened.elapsed())
    }
}

#[derive(Debug)]
pub(crate) struct SenderWorker {
    shared: Arc<EngineShared>,
    window: Option<RateWindow>,
}

impl SenderWorker {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        let window = match &shared.config.mode {
            BatchMode::RateLimit {
                requests_per_minute,
            } => Some(RateWindow::new(*requests_per_minute)),
            _ => None,
        };
        Self { shared, window }
    }

    /// 🕰️ Wait for the queue to reach `size`, giving up after `linger` without growth.
    /// Flushes and shutdowns don't wait for anybody.
    async fn linger(&self, size: usize) {
        let shared = &self.shared;
        let linger = shared.config.linger();
        let poll = shared.config.poll_interval();
        let mut seen = shared.queue.len();
        let mut deadline = Instant::now() + linger;
        while seen < size {
            if shared.is_stopping() || shared.flushing.load(Ordering::SeqCst) > 0 {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                trace!("🕰️ lingered long enough with {} of {} records", seen, size);
                return;
            }
            shared
                .queue
                .wait_for_records(poll.min(deadline - now))
                .await;
            let len = shared.queue.len();
            if len > seen {
                deadline = Instant::now() + linger;
            }
            seen = len;
        }
    }

    fn check_oom(&self) -> Result<(), BatchError> {
        let timeout = self.shared.config.oom_timeout();
        match self.shared.gate.oom_elapsed() {
            Some(elapsed) if elapsed >= timeout => {
                error!(
                    "💀 the server has been out of memory for {:?}, giving up",
                    elapsed
                );
                Err(self.shared.fail(BatchError::OutOfMemoryTimeout(timeout)))
            }
            _ => Ok(()),
        }
    }

    /// 📨 Send one popped batch. Returns the records that never made it onto the wire.
    async fn ship(&self, batch: &[Record]) -> Result<Vec<InsertionIndex>, BatchError> {
        let shared = &self.shared;
        let concurrency = shared.admission.concurrency();
        if let Err(err) = shared.transport.grow_to(concurrency).await {
            warn!("⚠️ could not grow to {} streams: {}", concurrency, err);
        }
        let mut sent = 0usize;
        for frame in frame_records(batch, shared.config.max_message_bytes) {
            let carried = frame_len(&frame);
            match shared.transport.send(frame, concurrency).await {
                Ok(()) => sent += carried,
                Err(err) if err.is_recoverable() => {
                    warn!(
                        "🔌 send failed ({}), {} records go back to the queue",
                        err,
                        batch.len() - sent
                    );
                    return Ok(batch[sent..].iter().map(Record::index).collect());
                }
                Err(err) => {
                    error!("💀 send failed for good: {}", err);
                    return Err(shared.fail(BatchError::Transport(err.to_string())));
                }
            }
        }
        trace!("📤 sent {} records", sent);
        Ok(Vec::new())
    }

    async fn run(mut self) -> Result<(), BatchError> {
        let shared = self.shared.clone();
        let poll = shared.config.poll_interval();
        debug!("📤 sender started");
        loop {
            shared.check_fatal()?;
            self.check_oom()?;

            if shared.is_stopping() && shared.queue.is_empty() {
                shared.transport.close_for_writing().await;
                shared.sender_done.store(true, Ordering::SeqCst);
                info!("🏁 sender finished, stop sent");
                return Ok(());
            }
            if !shared.gate.is_open() {
                tokio::time::sleep(poll).await;
                continue;
            }
            if shared.queue.is_empty() {
                shared.queue.wait_for_records(poll).await;
                continue;
            }
            let mut size = shared.admission.batch_size();
            if size == 0 {
                let _ = tokio::time::timeout(poll, shared.admission.wait_until_open()).await;
                continue;
            }
            self.linger(size).await;
            // -- the gate may have closed while we lingered
            size = size.min(shared.admission.batch_size());
            if !shared.gate.is_open() || size == 0 {
                continue;
            }

            if let Some(window) = self.window.as_mut() {
                let allowance = window.allowance();
                if allowance == 0 {
                    let wait = window.until_next_window().min(poll.max(Duration::from_millis(100)));
                    trace!("⏲️ rate window spent, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                    continue;
                }
                size = size.min(allowance);
            }

            let batch = shared.inflight.pop_and_register(&shared.queue, size);
            if batch.is_empty() {
                // -- everything queued is a reference waiting on an unacked object
                tokio::time::sleep(poll).await;
                continue;
            }
            if let Some(window) = self.window.as_mut() {
                window.sent += batch.len();
            }
            let unsent = self.ship(&batch).await?;
            if !unsent.is_empty() {
                shared.queue.prepend(shared.inflight.take_indices(&unsent));
                tokio::time::sleep(poll).await;
            }
        }
    }
}

fn frame_len(frame: &BatchStreamRequest) -> usize {
    match &frame.message {
        Some(batch_stream_request::Message::Data(data)) => data.objects.len() + data.references.len(),
        _ => 0,
    }
}

impl Worker for SenderWorker {
    fn start(self) -> JoinHandle<Result<(), BatchError>> {
        tokio::spawn(self.run())
    }
}
