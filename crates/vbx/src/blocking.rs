//! 🧱 The synchronous facade. Same engine, no `.await`.
//!
//! [`BatchClient`] owns a multi-thread tokio runtime and blocks on the async client for
//! every call. The background workers run on that runtime, so the caller's thread is only
//! ever parked inside one of these methods. Don't call it from inside another runtime;
//! tokio will (rightly) panic on a nested `block_on`.

use anyhow::Context;
use tokio::runtime::Runtime;

use crate::backends::{ClusterBackend, ConnectionConfig, ConnectorBackend};
use crate::config::{BatchConfig, ReadinessConfig};
use crate::engine::{self, AddedObject, EngineState};
use crate::error::BatchError;
use crate::records::{InsertionIndex, NewObject, NewReference, PendingObject, PendingReference};
use crate::results::{BatchResults, ErrorRecord};

#[derive(Debug)]
pub struct BatchClient {
    // -- declared first so the engine shuts down before its runtime does
    inner: engine::BatchClient,
    runtime: Runtime,
}

fn runtime() -> anyhow::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vbx-batch")
        .build()
        .context("💀 could not build the tokio runtime for the blocking batch client")
}

impl BatchClient {
    pub fn connect(connection: &ConnectionConfig, config: BatchConfig) -> anyhow::Result<Self> {
        let runtime = runtime()?;
        let inner = runtime.block_on(engine::BatchClient::connect(connection, config))?;
        Ok(Self { inner, runtime })
    }

    pub fn with_backends(
        config: BatchConfig,
        connector: ConnectorBackend,
        cluster: ClusterBackend,
    ) -> anyhow::Result<Self> {
        let runtime = runtime()?;
        let inner = runtime.block_on(engine::BatchClient::with_backends(config, connector, cluster))?;
        Ok(Self { inner, runtime })
    }

    pub fn add_object(&self, object: NewObject) -> Result<AddedObject, BatchError> {
        self.runtime.block_on(self.inner.add_object(object))
    }

    pub fn add_reference(&self, reference: NewReference) -> Result<Vec<InsertionIndex>, BatchError> {
        self.runtime.block_on(self.inner.add_reference(reference))
    }

    pub fn flush(&self) -> Result<(), BatchError> {
        self.runtime.block_on(self.inner.flush())
    }

    pub fn close(&self) -> Result<(), BatchError> {
        self.runtime.block_on(self.inner.close())
    }

    pub fn retry_failed_objects(&self) -> Result<Vec<AddedObject>, BatchError> {
        self.runtime.block_on(self.inner.retry_failed_objects())
    }

    pub fn retry_failed_references(&self) -> Result<Vec<InsertionIndex>, BatchError> {
        self.runtime.block_on(self.inner.retry_failed_references())
    }

    pub fn wait_for_vector_indexing(&self, config: &ReadinessConfig) -> Result<(), BatchError> {
        self.runtime.block_on(self.inner.wait_for_vector_indexing(config))
    }

    pub fn results(&self) -> BatchResults {
        self.inner.results()
    }

    pub fn failed_objects(&self) -> Vec<ErrorRecord<PendingObject>> {
        self.inner.failed_objects()
    }

    pub fn failed_references(&self) -> Vec<ErrorRecord<PendingReference>> {
        self.inner.failed_references()
    }

    pub fn number_errors(&self) -> u64 {
        self.inner.number_errors()
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    pub fn outstanding(&self) -> u64 {
        self.inner.outstanding()
    }
}
