//! 🚦 The admission controller: how many records per batch, how many streams, and
//! whether callers are allowed in at all right now.
//!
//! 🎬 *[the server's batch queue is 40,000 deep. the client wants to send 1,000 more.
//! the controller clears its throat.]*
//!
//! The control loop compares the server-side queue length against the server's
//! processing rate. A queue worth about two seconds of work is the sweet spot:
//! - `ratio` near 2: hold steady at what one worker can chew through per second.
//! - `ratio` below 2: the server is hungry, feed it more (x1.5 at a time).
//! - `ratio` above 2: the server is choking, shrink, and drop a stream if we get small.
//! - `ratio` of 10 or more: stop. Batch size 0. Callers block until it recovers.
//!
//! Fixed and rate-limited modes skip the loop entirely; the server's `Backoff` still
//! wins in every mode.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{BatchConfig, BatchMode};

/// 📉 Below this many records per batch we start giving streams back.
pub const BATCH_SIZE_FLOOR: usize = 100;
/// 🛑 A queue ten seconds deep means "stop sending".
pub const PAUSE_RATIO: f64 = 10.0;
const STEADY_BAND: (f64, f64) = (1.9, 2.1);
const GROWTH_FACTOR: f64 = 1.5;
// -- 20 samples, twenty seconds at the default tick
const RATE_HISTORY: usize = 20;

/// 📈 One observation of the server's batch statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub at: Instant,
    pub queue_length: u64,
    pub rate_per_second: f64,
}

#[derive(Debug)]
struct AdmissionState {
    concurrency: usize,
    last_concurrency_change: Option<Instant>,
    history: VecDeque<RateSample>,
}

#[derive(Debug)]
pub struct AdmissionController {
    mode: BatchMode,
    max_batch_size: usize,
    min_concurrency: usize,
    max_concurrency: usize,
    concurrency_cooldown: Duration,
    size: watch::Sender<usize>,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: &BatchConfig) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        let min_concurrency = config.min_concurrency.max(1);
        let (batch_size, concurrency) = match &config.mode {
            BatchMode::Dynamic => (
                config.initial_batch_size.clamp(1, max_batch_size),
                min_concurrency,
            ),
            BatchMode::FixedSize {
                batch_size,
                concurrency,
            } => ((*batch_size).max(1), (*concurrency).max(1)),
            BatchMode::RateLimit {
                requests_per_minute,
            } => ((*requests_per_minute).clamp(1, max_batch_size), 1),
        };
        let (size, _) = watch::channel(batch_size);
        Self {
            mode: config.mode.clone(),
            max_batch_size,
            min_concurrency,
            max_concurrency: config.stream_ceiling(),
            concurrency_cooldown: config.concurrency_cooldown(),
            size,
            state: Mutex::new(AdmissionState {
                concurrency,
                last_concurrency_change: None,
                history: VecDeque::with_capacity(RATE_HISTORY),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_size(&self) -> usize {
        *self.size.borrow()
    }

    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    pub fn mode(&self) -> &BatchMode {
        &self.mode
    }

    /// 📜 The most recent rate observations, oldest first.
    pub fn rate_history(&self) -> Vec<RateSample> {
        self.lock().history.iter().copied().collect()
    }

    /// 🧮 Feed one round of server statistics through the control loop.
    pub fn observe(&self, queue_length: u64, rate_per_second: f64) {
        let mut state = self.lock();
        if state.history.len() == RATE_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(RateSample {
            at: Instant::now(),
            queue_length,
            rate_per_second,
        });
        if self.mode != BatchMode::Dynamic {
            return;
        }

        let size = self.batch_size();
        let now = Instant::now();
        let next = if queue_length == 0 {
            let grown = grow(size).min(self.max_batch_size);
            if grown == self.max_batch_size && size == self.max_batch_size {
                self.bump_concurrency(&mut state, now);
            }
            grown
        } else if rate_per_second <= 0.0 {
            self.pause(&mut state, now);
            0
        } else {
            let ratio = queue_length as f64 / rate_per_second;
            let per_worker = rate_per_second / state.concurrency as f64;
            if ratio >= PAUSE_RATIO {
                self.pause(&mut state, now);
                0
            } else if ratio > STEADY_BAND.0 && ratio < STEADY_BAND.1 {
                clamp(per_worker.floor(), self.max_batch_size)
            } else if ratio <= STEADY_BAND.0 {
                let target = per_worker * 2.0 / ratio;
                let stepped = (grow(size) as f64).min(target);
                clamp(stepped.floor(), self.max_batch_size).max(size.min(self.max_batch_size))
            } else {
                let shrunk = clamp((per_worker * 2.0 / ratio).floor(), self.max_batch_size);
                if shrunk < BATCH_SIZE_FLOOR && state.concurrency > self.min_concurrency {
                    state.concurrency -= 1;
                    state.last_concurrency_change = Some(now);
                    debug!("🔽 shrinking to {} streams", state.concurrency);
                }
                shrunk
            }
        };
        if next != size {
            debug!(
                "🚦 batch size {} -> {} (queue {}, rate {:.1}/s, {} streams)",
                size, next, queue_length, rate_per_second, state.concurrency
            );
        }
        self.size.send_replace(next);
    }

    /// 🧯 The server said "this many, please". We listen, unless we're already leaving.
    pub fn apply_backoff(&self, batch_size: usize, stopping: bool) {
        if stopping {
            debug!("🧯 ignoring backoff to {} while stopping", batch_size);
            return;
        }
        info!("🧯 server asked for batches of {}", batch_size);
        self.size.send_replace(batch_size);
    }

    /// ⏳ Resolves as soon as the recommended batch size is above zero.
    pub async fn wait_until_open(&self) {
        let mut receiver = self.size.subscribe();
        // -- the sender lives as long as `self`, so this can only end by the predicate
        let _ = receiver.wait_for(|size| *size > 0).await;
    }

    fn bump_concurrency(&self, state: &mut AdmissionState, now: Instant) {
        if state.concurrency >= self.max_concurrency {
            return;
        }
        let cooled = state
            .last_concurrency_change
            .is_none_or(|at| now.duration_since(at) >= self.concurrency_cooldown);
        if cooled {
            state.concurrency += 1;
            state.last_concurrency_change = Some(now);
            info!("🔼 growing to {} streams", state.concurrency);
        }
    }

    fn pause(&self, state: &mut AdmissionState, now: Instant) {
        if state.concurrency != self.min_concurrency {
            state.concurrency = self.min_concurrency;
            state.last_concurrency_change = Some(now);
        }
        info!("🛑 server queue is too deep, pausing admission");
    }
}

fn grow(size: usize) -> usize {
    ((size as f64 * GROWTH_FACTOR) as usize).max(size + 1)
}

fn clamp(value: f64, max: usize) -> usize {
    (value.max(1.0) as usize).min(max)
}
