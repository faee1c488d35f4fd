//! 📡 gRPC connector: one `tonic` channel, many bidirectional batch streams.
//!
//! No generated client here. The message types live in [`crate::protocol`] and the
//! call goes through `tonic::client::Grpc` directly with a `ProstCodec`, which is all
//! a generated client would do for us anyway.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tonic::Code;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, trace};

use crate::backends::{ConnectionConfig, Connector};
use crate::error::TransportError;
use crate::protocol::{BATCH_STREAM_PATH, BatchStreamReply, BatchStreamRequest};
use crate::transport::BidiStream;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GrpcConnector {
    channel: Channel,
    authorization: Option<AsciiMetadataValue>,
    outbound_capacity: usize,
}

impl GrpcConnector {
    /// 🏗️ Builds a lazy channel: nothing touches the network until the first stream opens.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let channel = Endpoint::from_shared(config.grpc_url.clone())
            .with_context(|| {
                format!(
                    "💀 '{}' is not a gRPC endpoint we can work with. Expected something like http://host:50051",
                    config.grpc_url
                )
            })?
            .connect_timeout(config.connect_timeout())
            .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .keep_alive_while_idle(true)
            .connect_lazy();

        let authorization = config
            .api_key
            .as_ref()
            .map(|key| format!("Bearer {key}").parse::<AsciiMetadataValue>())
            .transpose()
            .context("💀 The API key contains characters that can't ride in a gRPC header")?;

        Ok(Self {
            channel,
            authorization,
            outbound_capacity: config.outbound_capacity.max(1),
        })
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn open_stream(&self, start: BatchStreamRequest) -> Result<BidiStream, TransportError> {
        let (outbound, requests) = async_channel::bounded(self.outbound_capacity);
        // -- queue Start before the call so a server that waits for the first message still answers
        outbound
            .send(start)
            .await
            .map_err(|_| TransportError::Fatal("outbound channel closed before Start".into()))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|err| TransportError::HangUp(format!("gRPC channel not ready: {err}")))?;

        let mut request = tonic::Request::new(requests);
        if let Some(authorization) = &self.authorization {
            request
                .metadata_mut()
                .insert("authorization", authorization.clone());
        }

        let codec = ProstCodec::<BatchStreamRequest, BatchStreamReply>::default();
        let response = grpc
            .streaming(request, PathAndQuery::from_static(BATCH_STREAM_PATH), codec)
            .await
            .map_err(classify_status)?;
        debug!("📡 batch stream open");

        let (replies, inbound) = async_channel::unbounded();
        let mut incoming = response.into_inner();
        let driver = tokio::spawn(async move {
            loop {
                match incoming.message().await {
                    Ok(Some(reply)) => {
                        trace!("📥 reply from server");
                        if replies.send(Ok(reply)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = replies.send(Err(classify_status(status))).await;
                        return;
                    }
                }
            }
        });

        Ok(BidiStream {
            outbound,
            inbound,
            driver: Some(driver),
        })
    }
}

/// 🕵️ Which statuses are "the line dropped" and which are "the server said no".
pub(crate) fn classify_status(status: tonic::Status) -> TransportError {
    let message = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable | Code::Cancelled | Code::Aborted | Code::DeadlineExceeded => {
            TransportError::HangUp(message)
        }
        Code::Unknown | Code::Internal => TransportError::from_message(message),
        _ => TransportError::Fatal(message),
    }
}
