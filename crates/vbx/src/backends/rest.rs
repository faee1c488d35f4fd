//! 🌐 REST cluster client: the unary side of the server.
//!
//! - `GET  /v1/nodes?output=verbose` for node health and batch queue statistics.
//! - `GET  /v1/schema/{collection}/shards[?tenant=]` for readiness polling.
//! - `POST /v1/batch/references` for the old-school reference batch path.
//!
//! Errors come back as [`ClusterError`], split into "try again" (network trouble, 5xx,
//! 429) and "the server said no" (everything else), because readiness polling only
//! retries the first kind.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::backends::{ClusterApi, ConnectionConfig, NodeStatus, ReferenceOutcome, ShardStatus};
use crate::error::ClusterError;
use crate::records::{PendingReference, Shard};

#[derive(Debug, Clone)]
pub struct RestCluster {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<NodeStatus>,
}

#[derive(Debug, Serialize)]
struct ReferenceBody<'a> {
    from: String,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ReferenceResponse {
    result: ReferenceResult,
}

#[derive(Debug, Deserialize)]
struct ReferenceResult {
    status: String,
    #[serde(default)]
    errors: Option<ReferenceErrors>,
}

#[derive(Debug, Deserialize)]
struct ReferenceErrors {
    #[serde(default)]
    error: Vec<ReferenceErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct ReferenceErrorMessage {
    message: String,
}

impl RestCluster {
    pub fn new(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .context("💀 The HTTP client refused to be born. Probably the TLS stack. It usually is.")?;
        let base_url = Url::parse(&config.rest_url).with_context(|| {
            format!(
                "💀 '{}' is not a REST base URL. Expected something like http://localhost:8080",
                config.rest_url
            )
        })?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClusterError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}")).map_err(|err| ClusterError::Rejected {
            status: 0,
            body: format!("could not build URL for {path}: {err}"),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClusterError> {
        trace!("🌐 GET {}", url);
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClusterError> {
    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        let body = response.text().await.unwrap_or_default();
        return Err(ClusterError::Transient(format!("{status}: {body}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClusterError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| ClusterError::Rejected {
            status: status.as_u16(),
            body: format!("undecodable response body: {err}"),
        })
}

fn target_of(reference: &PendingReference) -> String {
    match &reference.to_collection {
        Some(collection) => format!("{}/{}", collection, reference.to_uuid),
        None => reference.to_uuid.to_string(),
    }
}

#[async_trait]
impl ClusterApi for RestCluster {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, ClusterError> {
        let mut url = self.url("/v1/nodes")?;
        url.query_pairs_mut().append_pair("output", "verbose");
        let response: NodesResponse = self.get_json(url).await?;
        Ok(response.nodes)
    }

    async fn shards(&self, shard: &Shard) -> Result<Vec<ShardStatus>, ClusterError> {
        let mut url = self.url(&format!("/v1/schema/{}/shards", shard.collection))?;
        if let Some(tenant) = &shard.tenant {
            url.query_pairs_mut().append_pair("tenant", tenant);
        }
        self.get_json(url).await
    }

    async fn batch_references(
        &self,
        references: &[PendingReference],
    ) -> Result<Vec<ReferenceOutcome>, ClusterError> {
        let body: Vec<ReferenceBody<'_>> = references
            .iter()
            .map(|reference| ReferenceBody {
                from: format!(
                    "{}/{}/{}",
                    reference.from_collection, reference.from_uuid, reference.from_property
                ),
                to: target_of(reference),
                tenant: reference.tenant.as_deref(),
            })
            .collect();
        let url = self.url("/v1/batch/references")?;
        debug!("🔗 posting {} references", body.len());
        let response = self
            .authorize(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))?;
        let results: Vec<ReferenceResponse> = decode(response).await?;
        if results.len() != references.len() {
            return Err(ClusterError::Rejected {
                status: 200,
                body: format!(
                    "sent {} references, got {} results back",
                    references.len(),
                    results.len()
                ),
            });
        }
        Ok(results
            .into_iter()
            .map(|item| {
                if item.result.status.eq_ignore_ascii_case("SUCCESS") {
                    ReferenceOutcome::Success
                } else {
                    let message = item
                        .result
                        .errors
                        .map(|errors| {
                            errors
                                .error
                                .into_iter()
                                .map(|error| error.message)
                                .collect::<Vec<_>>()
                                .join("; ")
                        })
                        .filter(|message| !message.is_empty())
                        .unwrap_or_else(|| format!("status {}", item.result.status));
                    ReferenceOutcome::Failed(message)
                }
            })
            .collect())
    }
}
