use axum::{
    Json, async_trait,
    body::Bytes,
    extract::{Extension, FromRequest, Path, Request},
    http::{HeaderMap, Method, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

use super::protocol::{ApiResponse, CreateTopicRequest, PurgeResponse};
use crate::router::{
    Coordinator, CoordinatorError, FORWARDED_HEADER, ForwardRequest, ForwardedResponse, Route,
};
use crate::storage::{Context, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("request forwarded by shard {origin} is not owned here (owner: shard {owner})")]
    Misrouted { origin: String, owner: usize },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Misrouted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Coordinator(CoordinatorError::Store(e)) if e.is_not_found() => {
                StatusCode::NOT_FOUND
            }
            ApiError::Coordinator(CoordinatorError::Store(StoreError::InvalidName { .. })) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Coordinator(CoordinatorError::Forward(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Coordinator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed with {}: {}", status, self);
        } else {
            tracing::debug!("Request rejected with {}: {}", status, self);
        }
        (status, Json(ApiResponse::<()>::failure(self.to_string()))).into_response()
    }
}

/// A request kept as raw bytes until the routing decision is made, so that remote
/// requests can be replayed byte for byte.
pub struct Incoming {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

#[async_trait]
impl<S> FromRequest<S> for Incoming
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();
        let body = Bytes::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;

        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }
}

impl Incoming {
    fn forwarded_from(&self) -> Option<String> {
        self.headers
            .get(FORWARDED_HEADER)
            .map(|origin| String::from_utf8_lossy(origin.as_bytes()).into_owned())
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::BadRequest(e.to_string()))
    }

    fn to_forward(&self) -> ForwardRequest {
        let path_and_query = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| self.uri.path().to_string());

        ForwardRequest {
            method: self.method.clone(),
            path_and_query,
            content_type: self.headers.get(CONTENT_TYPE).cloned(),
            body: self.body.clone(),
        }
    }
}

fn respond<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn passthrough(upstream: ForwardedResponse) -> Response {
    let mut response = (upstream.status, upstream.body).into_response();
    match upstream.content_type {
        Some(content_type) => {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        None => {
            response.headers_mut().remove(CONTENT_TYPE);
        }
    }
    response
}

/// Forwards the request when `key` belongs to another shard. `None` means serve locally.
async fn proxy_if_remote(
    coordinator: &Coordinator,
    key: &str,
    incoming: &Incoming,
) -> Result<Option<Response>, ApiError> {
    let Route::Remote { shard, address } = coordinator.route(key) else {
        return Ok(None);
    };

    if let Some(origin) = incoming.forwarded_from() {
        return Err(ApiError::Misrouted {
            origin,
            owner: shard,
        });
    }

    let upstream = coordinator
        .forward(shard, &address, incoming.to_forward())
        .await?;
    Ok(Some(passthrough(upstream)))
}

// --- Topics ---

pub async fn handle_create_topic(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    let request: CreateTopicRequest = incoming.decode()?;
    if let Some(response) = proxy_if_remote(&coordinator, &request.name, &incoming).await? {
        return Ok(response);
    }

    let topic = coordinator.create_topic(request.name).await?;
    Ok(respond(topic))
}

pub async fn handle_list_topics(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Result<Response, ApiError> {
    let topics = coordinator.list_topics().await?;
    Ok(respond(topics))
}

pub async fn handle_get_topic(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(topic): Path<String>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&coordinator, &topic, &incoming).await? {
        return Ok(response);
    }

    let topic = coordinator.get_topic(topic).await?;
    Ok(respond(topic))
}

pub async fn handle_delete_topic(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(topic): Path<String>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&coordinator, &topic, &incoming).await? {
        return Ok(response);
    }

    let removal = coordinator.delete_topic(topic).await?;
    Ok(respond(removal))
}

/// Peer-to-peer half of a topic delete: drops only this node's namespace of the topic.
pub async fn handle_internal_delete_topic(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(topic): Path<String>,
) -> Result<Response, ApiError> {
    let removal = coordinator.delete_local_topic(topic).await?;
    Ok(respond(removal))
}

// --- Contexts ---

pub async fn handle_store_context(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(topic): Path<String>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    let context: Context = incoming.decode()?;

    // Without an id the receiving node picks one it owns.
    if !context.metadata.id.is_empty()
        && let Some(response) = proxy_if_remote(&coordinator, context.id(), &incoming).await?
    {
        return Ok(response);
    }

    let stored = coordinator.store_context(topic, context).await?;
    Ok(respond(stored))
}

pub async fn handle_list_contexts(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(topic): Path<String>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&coordinator, &topic, &incoming).await? {
        return Ok(response);
    }

    let contexts = coordinator.list_contexts(topic).await?;
    Ok(respond(contexts))
}

pub async fn handle_get_context(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((topic, id)): Path<(String, String)>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&coordinator, &id, &incoming).await? {
        return Ok(response);
    }

    let context = coordinator.get_context(topic, id).await?;
    Ok(respond(context))
}

pub async fn handle_delete_context(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((topic, id)): Path<(String, String)>,
    incoming: Incoming,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&coordinator, &id, &incoming).await? {
        return Ok(response);
    }

    coordinator.delete_context(topic, id).await?;
    Ok((StatusCode::OK, Json(ApiResponse::done())).into_response())
}

// --- Node administration ---

pub async fn handle_purge(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Result<Response, ApiError> {
    let removed = coordinator.purge_foreign_contexts().await?;
    Ok(respond(PurgeResponse { removed }))
}

pub async fn handle_stats(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Result<Response, ApiError> {
    let stats = coordinator.stats().await?;
    Ok(respond(stats))
}
