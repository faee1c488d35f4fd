//! 📡 The stream transport: N long-lived bidirectional streams, one generation at a time.
//!
//! 🎬 *[the streams open. a counter ticks from 41 to 42. somewhere, an event from
//! generation 41 arrives late to the party and is politely shown the door.]*
//!
//! Each stream gets its own outbound channel, so writes to one stream are serialized
//! without a lock. Inbound traffic from every stream is demultiplexed into one event
//! channel. Every event carries the generation it was born in, so once a reconnect
//! has happened the stragglers from the old connection can be told apart from news.

pub mod framing;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backends::{Connector, ConnectorBackend};
use crate::config::ConsistencyLevel;
use crate::error::TransportError;
use crate::protocol::{BatchStreamReply, BatchStreamRequest, ControlSignal};

/// 🔌 What a connector hands back: a way in, a way out, and (optionally) the task
/// driving the connection, which we abort on teardown.
#[derive(Debug)]
pub struct BidiStream {
    pub outbound: async_channel::Sender<BatchStreamRequest>,
    pub inbound: async_channel::Receiver<Result<BatchStreamReply, TransportError>>,
    pub driver: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamEventKind {
    Signal(ControlSignal),
    Failed(TransportError),
    /// 🏁 The server closed its side cleanly.
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamEvent {
    pub generation: u64,
    pub stream_id: usize,
    pub kind: StreamEventKind,
}

#[derive(Debug)]
struct StreamSlot {
    id: usize,
    outbound: async_channel::Sender<BatchStreamRequest>,
    pump: JoinHandle<()>,
    driver: Option<JoinHandle<()>>,
}

impl StreamSlot {
    fn shut(self) {
        self.outbound.close();
        self.pump.abort();
        if let Some(driver) = self.driver {
            driver.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamTransport {
    connector: ConnectorBackend,
    consistency: ConsistencyLevel,
    generation: AtomicU64,
    next_stream_id: AtomicUsize,
    cursor: AtomicUsize,
    streams: Mutex<Vec<StreamSlot>>,
    events_tx: async_channel::Sender<StreamEvent>,
    events_rx: async_channel::Receiver<StreamEvent>,
}

impl StreamTransport {
    pub(crate) fn new(connector: ConnectorBackend, consistency: ConsistencyLevel) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            connector,
            consistency,
            generation: AtomicU64::new(0),
            next_stream_id: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
            events_tx,
            events_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StreamSlot>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.lock().len()
    }

    /// 📥 The one event channel. Survives every reconnect.
    pub(crate) fn events(&self) -> async_channel::Receiver<StreamEvent> {
        self.events_rx.clone()
    }

    /// 🆕 Tear down whatever is open and start a new generation with `count` streams.
    /// If any stream fails to open, the ones that did open are shut again.
    pub(crate) async fn open_generation(&self, count: usize) -> Result<u64, TransportError> {
        self.teardown();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut opened = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            match self.open_one(generation).await {
                Ok(slot) => opened.push(slot),
                Err(err) => {
                    opened.into_iter().for_each(StreamSlot::shut);
                    return Err(err);
                }
            }
        }
        debug!("📡 generation {} is up with {} streams", generation, opened.len());
        let stale = std::mem::replace(&mut *self.lock(), opened);
        stale.into_iter().for_each(StreamSlot::shut);
        Ok(generation)
    }

    /// 🔼 Open extra streams in the current generation until there are `count`.
    pub(crate) async fn grow_to(&self, count: usize) -> Result<(), TransportError> {
        let generation = self.generation();
        while self.stream_count() < count {
            let slot = self.open_one(generation).await?;
            if self.generation() != generation {
                // -- a reconnect overtook us, this stream belongs to nobody
                slot.shut();
                return Ok(());
            }
            debug!("🔼 opened stream {} in generation {}", slot.id, generation);
            self.lock().push(slot);
        }
        Ok(())
    }

    async fn open_one(&self, generation: u64) -> Result<StreamSlot, TransportError> {
        let stream = self
            .connector
            .open_stream(BatchStreamRequest::start(self.consistency))
            .await?;
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let events = self.events_tx.clone();
        let inbound = stream.inbound;
        let pump = tokio::spawn(async move {
            while let Ok(item) = inbound.recv().await {
                let kind = match item {
                    Ok(reply) => match ControlSignal::from_reply(reply) {
                        Some(signal) => StreamEventKind::Signal(signal),
                        None => continue,
                    },
                    Err(err) => {
                        let _ = events
                            .send(StreamEvent {
                                generation,
                                stream_id: id,
                                kind: StreamEventKind::Failed(err),
                            })
                            .await;
                        return;
                    }
                };
                let event = StreamEvent {
                    generation,
                    stream_id: id,
                    kind,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events
                .send(StreamEvent {
                    generation,
                    stream_id: id,
                    kind: StreamEventKind::Ended,
                })
                .await;
        });
        Ok(StreamSlot {
            id,
            outbound: stream.outbound,
            pump,
            driver: stream.driver,
        })
    }

    /// 🎯 Route one frame: the next idle stream in round-robin order, else the least loaded.
    /// Only the first `active` streams are used, so shrinking concurrency needs no teardown.
    pub(crate) async fn send(
        &self,
        frame: BatchStreamRequest,
        active: usize,
    ) -> Result<(), TransportError> {
        let candidates: Vec<(usize, async_channel::Sender<BatchStreamRequest>)> = self
            .lock()
            .iter()
            .take(active.max(1))
            .map(|slot| (slot.id, slot.outbound.clone()))
            .collect();
        if candidates.is_empty() {
            return Err(TransportError::HangUp("no open streams".into()));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let (id, outbound) = (0..candidates.len())
            .map(|offset| &candidates[(start + offset) % candidates.len()])
            .find(|(_, outbound)| outbound.is_empty())
            .or_else(|| candidates.iter().min_by_key(|(_, outbound)| outbound.len()))
            .ok_or_else(|| TransportError::HangUp("no open streams".into()))?;
        trace!("📨 frame -> stream {}", id);
        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::HangUp(format!("stream {id} is closed for writing")))
    }

    /// 🛑 Say `Stop` on every stream and close the outbound side. Replies keep flowing.
    pub(crate) async fn close_for_writing(&self) {
        let outbounds: Vec<_> = self
            .lock()
            .iter()
            .map(|slot| slot.outbound.clone())
            .collect();
        for outbound in outbounds {
            let _ = outbound.send(BatchStreamRequest::stop()).await;
            outbound.close();
        }
        debug!("🛑 stop sent on every stream");
    }

    /// 💥 Drop every stream of the current generation on the floor.
    pub(crate) fn teardown(&self) {
        let slots = std::mem::take(&mut *self.lock());
        if !slots.is_empty() {
            debug!("💥 tearing down {} streams", slots.len());
        }
        slots.into_iter().for_each(StreamSlot::shut);
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}
