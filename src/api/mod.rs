//! HTTP API Module
//!
//! Client-facing axum routes. Every node serves the full API: handlers resolve the routing key
//! of the request first, proxy it to the owning node when it is remote, and only then decode
//! and execute it locally.

pub mod handlers;
pub mod protocol;

use axum::{
    Router,
    extract::Extension,
    routing::{delete, get, post},
};
use std::sync::Arc;

use crate::router::Coordinator;
use handlers::*;
use protocol::*;

pub use handlers::ApiError;
pub use protocol::ApiResponse;

/// Builds the node's HTTP router around a shared coordinator.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route(
            ENDPOINT_TOPICS,
            post(handle_create_topic).get(handle_list_topics),
        )
        .route(
            ENDPOINT_TOPIC,
            get(handle_get_topic).delete(handle_delete_topic),
        )
        .route(
            ENDPOINT_CONTEXTS,
            post(handle_store_context).get(handle_list_contexts),
        )
        .route(
            ENDPOINT_CONTEXT,
            get(handle_get_context).delete(handle_delete_context),
        )
        .route(ENDPOINT_PURGE, post(handle_purge))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_INTERNAL_TOPIC, delete(handle_internal_delete_topic))
        .layer(Extension(coordinator))
}

#[cfg(test)]
mod tests;
