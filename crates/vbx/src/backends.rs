//! 🔌 Backends: the places we talk to.
//!
//! Two seams, each a trait plus an enum that dispatches to the concrete thing:
//! - [`Connector`]: opens one bidirectional batch stream. gRPC in production,
//!   an in-memory simulated server in tests.
//! - [`ClusterApi`]: the unary side. Node statistics for the admission ticker and
//!   reconnect health checks, shard status for readiness, and the reference batch
//!   endpoint. REST in production, the same simulated server in tests.
//!
//! The engine only ever holds the enums. Adding a backend means a new variant and a
//! new arm in each `match`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ClusterError, TransportError};
use crate::protocol::BatchStreamRequest;
use crate::records::{PendingReference, Shard};
use crate::transport::BidiStream;

pub mod grpc;
pub mod in_mem;
pub mod rest;

/// 🌐 Where the server lives and how to prove we're allowed in.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// 📡 gRPC endpoint of the batch stream, e.g. `http://localhost:50051`.
    pub grpc_url: String,
    /// 🌐 REST base URL, e.g. `http://localhost:8080`.
    pub rest_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 📬 Frames buffered per stream before the sender waits on it.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_outbound_capacity() -> usize {
    4
}

impl ConnectionConfig {
    pub fn new(grpc_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            grpc_url: grpc_url.into(),
            rest_url: rest_url.into(),
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            outbound_capacity: default_outbound_capacity(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 📊 Server-side batch queue statistics for one node.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    #[serde(default)]
    pub queue_length: u64,
    #[serde(default)]
    pub rate_per_second: f64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub batch_stats: Option<BatchStats>,
}

impl NodeStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("HEALTHY")
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub vector_queue_size: u64,
}

impl ShardStatus {
    /// ✅ READY with nothing left in the vector indexing queue.
    pub fn is_caught_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("READY") && self.vector_queue_size == 0
    }
}

/// 🔗 Outcome of one reference sent through the unary reference endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceOutcome {
    Success,
    Failed(String),
}

#[async_trait]
pub trait Connector: std::fmt::Debug + Send + Sync {
    /// 📡 Open one stream. `start` is the first message on it; some servers won't
    /// send response headers until they've heard from us.
    async fn open_stream(&self, start: BatchStreamRequest) -> Result<BidiStream, TransportError>;
}

#[async_trait]
pub trait ClusterApi: std::fmt::Debug + Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, ClusterError>;
    async fn shards(&self, shard: &Shard) -> Result<Vec<ShardStatus>, ClusterError>;
    /// 🔗 One outcome per input reference, same order.
    async fn batch_references(
        &self,
        references: &[PendingReference],
    ) -> Result<Vec<ReferenceOutcome>, ClusterError>;
}

#[derive(Debug)]
pub enum ConnectorBackend {
    Grpc(grpc::GrpcConnector),
    InMemory(in_mem::InMemoryConnector),
}

#[async_trait]
impl Connector for ConnectorBackend {
    async fn open_stream(&self, start: BatchStreamRequest) -> Result<BidiStream, TransportError> {
        match self {
            ConnectorBackend::Grpc(grpc) => grpc.open_stream(start).await,
            ConnectorBackend::InMemory(in_mem) => in_mem.open_stream(start).await,
        }
    }
}

#[derive(Debug)]
pub enum ClusterBackend {
    Rest(rest::RestCluster),
    InMemory(in_mem::InMemoryCluster),
}

#[async_trait]
impl ClusterApi for ClusterBackend {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, ClusterError> {
        match self {
            ClusterBackend::Rest(rest) => rest.nodes().await,
            ClusterBackend::InMemory(in_mem) => in_mem.nodes().await,
        }
    }

    async fn shards(&self, shard: &Shard) -> Result<Vec<ShardStatus>, ClusterError> {
        match self {
            ClusterBackend::Rest(rest) => rest.shards(shard).await,
            ClusterBackend::InMemory(in_mem) => in_mem.shards(shard).await,
        }
    }

    async fn batch_references(
        &self,
        references: &[PendingReference],
    ) -> Result<Vec<ReferenceOutcome>, ClusterError> {
        match self {
            ClusterBackend::Rest(rest) => rest.batch_references(references).await,
            ClusterBackend::InMemory(in_mem) => in_mem.batch_references(references).await,
        }
    }
}
