//! 🧪 In-memory backends: a simulated server for tests and local experiments.
//!
//! 🎬 *[a server that never crashes unless you ask it to. a server that shuts down
//! exactly when the script says. the most reliable unreliable server ever built.]*
//!
//! [`InMemoryServer`] speaks the batch stream protocol over channels and answers the
//! cluster API from a few tables. A [`ServerScript`] decides when it misbehaves:
//! refuse connects, hang up, shut down, run out of memory, throttle. Every object and
//! reference it receives is counted, so tests can check "nothing lost, nothing
//! stored twice" after the dust settles.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::backends::{
    BatchStats, ClusterApi, ClusterBackend, Connector, ConnectorBackend, NodeStatus,
    ReferenceOutcome, ShardStatus,
};
use crate::error::{ClusterError, TransportError};
use crate::protocol::{
    Acks, Backoff, BatchObject, BatchStreamReply, BatchStreamRequest, Data, OutOfMemory, ResultError,
    ResultSuccess, Results, Shutdown, ShuttingDown, Started, batch_stream_reply, batch_stream_request,
};
use crate::records::{PendingReference, Shard};
use crate::transport::BidiStream;

type ReplySender = async_channel::Sender<Result<BatchStreamReply, TransportError>>;

/// 🎭 When and how the simulated server misbehaves. Frame counts are global across
/// every stream and connection, starting at 1. Each scripted event fires once.
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    /// 🚪 The first N connection attempts are refused.
    pub refuse_connects: usize,
    /// 🧱 Every connection attempt after the first N is refused.
    pub refuse_connects_after: Option<usize>,
    /// 🧯 Send `Backoff` right after `Started`.
    pub backoff_on_start: Option<usize>,
    /// 👋 On this data frame: `ShuttingDown`, `Shutdown`, end of stream, no results.
    pub shutdown_after_frames: Option<usize>,
    /// 🔌 On this data frame: the stream fails with a hang-up, no results.
    pub hang_up_after_frames: Option<usize>,
    /// 🧠 On this data frame: `OutOfMemory` for the whole frame, then a shutdown.
    pub oom_after_frames: Option<usize>,
    /// 🙈 Never acknowledge, only send results.
    pub skip_acks: bool,
    /// 🐌 Pause between acks and results.
    pub result_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct ServerState {
    script: ServerScript,
    connects: usize,
    frames: usize,
    received: HashMap<String, usize>,
    stored_objects: BTreeMap<String, BatchObject>,
    stored_references: BTreeSet<String>,
    failures: HashMap<String, (String, usize)>,
    nodes: Vec<NodeStatus>,
    nodes_script: VecDeque<Result<Vec<NodeStatus>, ClusterError>>,
    shards_script: VecDeque<Result<Vec<ShardStatus>, ClusterError>>,
    shard_polls: usize,
    live: Vec<ReplySender>,
}

#[derive(Debug, Default)]
struct FramePlan {
    acks: Option<BatchStreamReply>,
    results: Option<BatchStreamReply>,
    farewell: Vec<BatchStreamReply>,
    hang_up: bool,
}

fn reply(message: batch_stream_reply::Message) -> BatchStreamReply {
    BatchStreamReply::new(message)
}

impl ServerState {
    /// 🎯 Consume a scripted one-shot event if it is due on this frame.
    fn fires(slot: &mut Option<usize>, frame: usize) -> bool {
        if *slot == Some(frame) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn take_failure(&mut self, key: &str) -> Option<String> {
        let (message, remaining) = self.failures.get_mut(key)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(message.clone())
    }

    fn plan(&mut self, data: Data) -> FramePlan {
        self.frames += 1;
        let frame = self.frames;
        let uuids: Vec<String> = data.objects.iter().map(|o| o.uuid.clone()).collect();
        let beacons: Vec<String> = data.references.iter().map(|r| r.beacon()).collect();
        for key in uuids.iter().chain(beacons.iter()) {
            *self.received.entry(key.clone()).or_default() += 1;
        }
        trace!("🧪 frame {} with {} objects, {} references", frame, uuids.len(), beacons.len());

        if Self::fires(&mut self.script.hang_up_after_frames, frame) {
            debug!("🧪 hanging up on frame {}", frame);
            return FramePlan {
                hang_up: true,
                ..FramePlan::default()
            };
        }
        let farewell = vec![
            reply(batch_stream_reply::Message::ShuttingDown(ShuttingDown {})),
            reply(batch_stream_reply::Message::Shutdown(Shutdown {})),
        ];
        if Self::fires(&mut self.script.shutdown_after_frames, frame) {
            debug!("🧪 shutting down on frame {}", frame);
            return FramePlan {
                farewell,
                ..FramePlan::default()
            };
        }
        if Self::fires(&mut self.script.oom_after_frames, frame) {
            debug!("🧪 out of memory on frame {}", frame);
            let mut replies = vec![reply(batch_stream_reply::Message::OutOfMemory(OutOfMemory {
                uuids,
                beacons,
            }))];
            replies.extend(farewell);
            return FramePlan {
                farewell: replies,
                ..FramePlan::default()
            };
        }

        let acks = (!self.script.skip_acks).then(|| {
            reply(batch_stream_reply::Message::Acks(Acks {
                uuids: uuids.clone(),
                beacons: beacons.clone(),
            }))
        });

        let mut results = Results::default();
        for object in data.objects {
            match self.take_failure(&object.uuid) {
                Some(error) => results.errors.push(ResultError {
                    error,
                    uuid: Some(object.uuid.clone()),
                    beacon: None,
                }),
                None => {
                    results.successes.push(ResultSuccess {
                        uuid: Some(object.uuid.clone()),
                        beacon: None,
                    });
                    self.stored_objects.insert(object.uuid.clone(), object);
                }
            }
        }
        for beacon in beacons {
            match self.take_failure(&beacon) {
                Some(error) => results.errors.push(ResultError {
                    error,
                    uuid: None,
                    beacon: Some(beacon),
                }),
                None => {
                    results.successes.push(ResultSuccess {
                        uuid: None,
                        beacon: Some(beacon.clone()),
                    });
                    self.stored_references.insert(beacon);
                }
            }
        }
        FramePlan {
            acks,
            results: Some(reply(batch_stream_reply::Message::Results(results))),
            ..FramePlan::default()
        }
    }
}

/// 🧪 The simulated server. Cheap to clone, every clone sees the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryServer {
    pub fn new(script: ServerScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                script,
                ..ServerState::default()
            })),
        }
    }

    pub fn connector(&self) -> ConnectorBackend {
        ConnectorBackend::InMemory(InMemoryConnector {
            state: self.state.clone(),
        })
    }

    pub fn cluster(&self) -> ClusterBackend {
        ClusterBackend::InMemory(InMemoryCluster {
            state: self.state.clone(),
        })
    }

    /// 💀 Fail the object (by UUID) or reference (by beacon) `times` times with `message`.
    pub fn fail(&self, key: impl Into<String>, message: impl Into<String>, times: usize) {
        lock(&self.state)
            .failures
            .insert(key.into(), (message.into(), times));
    }

    pub fn set_nodes(&self, nodes: Vec<NodeStatus>) {
        lock(&self.state).nodes = nodes;
    }

    /// 📜 Queue a one-off answer for the next `nodes()` call.
    pub fn push_nodes_response(&self, response: Result<Vec<NodeStatus>, ClusterError>) {
        lock(&self.state).nodes_script.push_back(response);
    }

    /// 📜 Queue a one-off answer for the next `shards()` call.
    pub fn push_shards_response(&self, response: Result<Vec<ShardStatus>, ClusterError>) {
        lock(&self.state).shards_script.push_back(response);
    }

    /// 🧯 Tell every open stream to use batches of `batch_size`.
    pub fn broadcast_backoff(&self, batch_size: usize) {
        let mut state = lock(&self.state);
        state.live.retain(|replies| !replies.is_closed());
        for replies in &state.live {
            let _ = replies.try_send(Ok(reply(batch_stream_reply::Message::Backoff(Backoff {
                batch_size: i32::try_from(batch_size).unwrap_or(i32::MAX),
            }))));
        }
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn frames(&self) -> usize {
        lock(&self.state).frames
    }

    /// 🔢 How many times an object UUID or reference beacon arrived on the wire.
    pub fn received_count(&self, key: &str) -> usize {
        lock(&self.state).received.get(key).copied().unwrap_or(0)
    }

    pub fn stored_objects(&self) -> Vec<BatchObject> {
        lock(&self.state).stored_objects.values().cloned().collect()
    }

    pub fn stored_references(&self) -> Vec<String> {
        lock(&self.state).stored_references.iter().cloned().collect()
    }

    pub fn shard_polls(&self) -> usize {
        lock(&self.state).shard_polls
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn open_stream(&self, start: BatchStreamRequest) -> Result<BidiStream, TransportError> {
        let (outbound, requests) = async_channel::bounded(4);
        let (replies, inbound) = async_channel::unbounded();
        {
            let mut state = lock(&self.state);
            state.connects += 1;
            let refused = state.connects <= state.script.refuse_connects
                || state
                    .script
                    .refuse_connects_after
                    .is_some_and(|limit| state.connects > limit);
            if refused {
                return Err(TransportError::HangUp("connection refused".into()));
            }
            state.live.push(replies.clone());
        }
        outbound
            .send(start)
            .await
            .map_err(|_| TransportError::Fatal("outbound channel closed before Start".into()))?;
        let driver = tokio::spawn(serve(self.state.clone(), requests, replies));
        Ok(BidiStream {
            outbound,
            inbound,
            driver: Some(driver),
        })
    }
}

async fn serve(
    state: Arc<Mutex<ServerState>>,
    requests: async_channel::Receiver<BatchStreamRequest>,
    replies: ReplySender,
) {
    answer(&state, &requests, &replies).await;
    // -- `live` holds clones of the sender, dropping ours would not end the stream
    replies.close();
}

async fn answer(
    state: &Mutex<ServerState>,
    requests: &async_channel::Receiver<BatchStreamRequest>,
    replies: &ReplySender,
) {
    use batch_stream_request::Message;
    while let Ok(request) = requests.recv().await {
        match request.message {
            Some(Message::Start(_)) => {
                let backoff = lock(state).script.backoff_on_start;
                if replies
                    .send(Ok(reply(batch_stream_reply::Message::Started(Started {}))))
                    .await
                    .is_err()
                {
                    return;
                }
                if let Some(batch_size) = backoff {
                    let _ = replies
                        .send(Ok(reply(batch_stream_reply::Message::Backoff(Backoff {
                            batch_size: i32::try_from(batch_size).unwrap_or(i32::MAX),
                        }))))
                        .await;
                }
            }
            Some(Message::Data(data)) => {
                let (plan, delay) = {
                    let mut state = lock(state);
                    (state.plan(data), state.script.result_delay)
                };
                if plan.hang_up {
                    let _ = replies
                        .send(Err(TransportError::HangUp("connection reset by peer".into())))
                        .await;
                    return;
                }
                if !plan.farewell.is_empty() {
                    for farewell in plan.farewell {
                        let _ = replies.send(Ok(farewell)).await;
                    }
                    return;
                }
                if let Some(acks) = plan.acks {
                    let _ = replies.send(Ok(acks)).await;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(results) = plan.results {
                    let _ = replies.send(Ok(results)).await;
                }
            }
            Some(Message::Stop(_)) | None => return,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ServerState>>,
}

fn default_node() -> NodeStatus {
    NodeStatus {
        name: "node-1".into(),
        status: "HEALTHY".into(),
        batch_stats: Some(BatchStats {
            queue_length: 0,
            rate_per_second: 1000.0,
        }),
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, ClusterError> {
        let mut state = lock(&self.state);
        if let Some(response) = state.nodes_script.pop_front() {
            return response;
        }
        if state.nodes.is_empty() {
            Ok(vec![default_node()])
        } else {
            Ok(state.nodes.clone())
        }
    }

    async fn shards(&self, shard: &Shard) -> Result<Vec<ShardStatus>, ClusterError> {
        let mut state = lock(&self.state);
        state.shard_polls += 1;
        if let Some(response) = state.shards_script.pop_front() {
            return response;
        }
        Ok(vec![ShardStatus {
            name: shard.tenant.clone().unwrap_or_else(|| "shard-1".into()),
            status: "READY".into(),
            vector_queue_size: 0,
        }])
    }

    async fn batch_references(
        &self,
        references: &[PendingReference],
    ) -> Result<Vec<ReferenceOutcome>, ClusterError> {
        let mut state = lock(&self.state);
        Ok(references
            .iter()
            .map(|reference| {
                let beacon = reference.beacon();
                *state.received.entry(beacon.clone()).or_default() += 1;
                match state.take_failure(&beacon) {
                    Some(message) => ReferenceOutcome::Failed(message),
                    None => {
                        state.stored_references.insert(beacon);
                        ReferenceOutcome::Success
                    }
                }
            })
            .collect())
    }
}
