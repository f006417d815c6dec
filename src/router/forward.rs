use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::coordinator::TopicRemoval;
use crate::api::protocol::{ENDPOINT_INTERNAL_TOPIC, ENDPOINT_TOPIC};

/// Set on every forwarded request; carries the index of the shard that forwarded it.
pub const FORWARDED_HEADER: &str = "x-vault-forwarded-from";

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("shard {shard} at {address} is unreachable: {source}")]
    Transport {
        shard: usize,
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("shard {shard} answered {status}: {body}")]
    Upstream {
        shard: usize,
        status: StatusCode,
        body: String,
    },

    #[error("shard {shard} has an unusable address {address}: {reason}")]
    InvalidAddress {
        shard: usize,
        address: String,
        reason: String,
    },
}

/// Only the payload of a peer's response envelope is of interest here.
#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

/// The parts of an incoming request that are replayed on the owning node.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Replays requests on peer nodes, one attempt each.
pub struct Forwarder {
    http_client: reqwest::Client,
    origin: usize,
}

impl Forwarder {
    pub fn new(origin: usize, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            origin,
        })
    }

    pub async fn forward(
        &self,
        shard: usize,
        address: &str,
        request: ForwardRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let url = format!("{}{}", base_url(address), request.path_and_query);
        tracing::debug!("Forwarding {} {} to shard {}", request.method, url, shard);

        let mut builder = self
            .http_client
            .request(request.method, &url)
            .header(FORWARDED_HEADER, self.origin.to_string())
            .body(request.body);
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }

        let transport = |source: reqwest::Error| ForwardError::Transport {
            shard,
            address: address.to_string(),
            source,
        };

        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response.bytes().await.map_err(transport)?;

        if !status.is_success() {
            tracing::warn!("Shard {} answered {} for {}", shard, status, url);
            return Err(ForwardError::Upstream {
                shard,
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(ForwardedResponse {
            status,
            content_type,
            body,
        })
    }

    /// Asks the topic's home shard whether the topic has been created.
    pub async fn topic_exists(
        &self,
        shard: usize,
        address: &str,
        topic: &str,
    ) -> Result<bool, ForwardError> {
        let url = endpoint_url(shard, address, ENDPOINT_TOPIC, topic)?;
        tracing::debug!("Checking topic {} on shard {}", topic, shard);

        let response = self
            .http_client
            .get(url)
            .header(FORWARDED_HEADER, self.origin.to_string())
            .send()
            .await
            .map_err(|source| ForwardError::Transport {
                shard,
                address: address.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(upstream_error(shard, status, response).await),
        }
    }

    /// Drops a peer's local namespace of `topic`. A peer that never held it removes nothing.
    pub async fn drop_topic(
        &self,
        shard: usize,
        address: &str,
        topic: &str,
    ) -> Result<usize, ForwardError> {
        let url = endpoint_url(shard, address, ENDPOINT_INTERNAL_TOPIC, topic)?;
        let transport = |source: reqwest::Error| ForwardError::Transport {
            shard,
            address: address.to_string(),
            source,
        };

        let response = self
            .http_client
            .delete(url)
            .header(FORWARDED_HEADER, self.origin.to_string())
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            status if status.is_success() => {
                let envelope: Envelope<TopicRemoval> = response.json().await.map_err(transport)?;
                Ok(envelope.data.map_or(0, |removal| removal.removed_contexts))
            }
            StatusCode::NOT_FOUND => Ok(0),
            status => Err(upstream_error(shard, status, response).await),
        }
    }
}

async fn upstream_error(shard: usize, status: StatusCode, response: reqwest::Response) -> ForwardError {
    let body = response.text().await.unwrap_or_default();
    ForwardError::Upstream {
        shard,
        status,
        body,
    }
}

/// Builds the URL of a `:topic` endpoint on `address` with the topic name percent-encoded.
fn endpoint_url(
    shard: usize,
    address: &str,
    template: &str,
    topic: &str,
) -> Result<reqwest::Url, ForwardError> {
    let invalid = |reason: String| ForwardError::InvalidAddress {
        shard,
        address: address.to_string(),
        reason,
    };

    let mut url = reqwest::Url::parse(&base_url(address)).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("not a base URL".to_string()))?
        .clear()
        .extend(
            template
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| if segment == ":topic" { topic } else { segment }),
        );
    Ok(url)
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
