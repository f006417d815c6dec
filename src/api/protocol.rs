//! Public HTTP Protocol
//!
//! Endpoints and Data Transfer Objects of the client-facing API. Every response body is an
//! [`ApiResponse`] envelope; forwarded responses are passed through unchanged, so clients see
//! the same envelope no matter which node they contacted.

use serde::{Deserialize, Serialize};

use crate::router::PurgedContext;

// --- API Endpoints ---

/// Create (POST) and list (GET) topics.
pub const ENDPOINT_TOPICS: &str = "/api/v1/topics";
/// Read (GET) and delete (DELETE) a single topic.
pub const ENDPOINT_TOPIC: &str = "/api/v1/topics/:topic";
/// Store (POST) and list (GET) contexts of a topic.
pub const ENDPOINT_CONTEXTS: &str = "/api/v1/topics/:topic/contexts";
/// Read (GET) and delete (DELETE) a single context.
pub const ENDPOINT_CONTEXT: &str = "/api/v1/topics/:topic/contexts/:id";
/// Drop local contexts whose ids are owned by another shard.
pub const ENDPOINT_PURGE: &str = "/api/v1/admin/purge";
/// Node-local shard and cache statistics.
pub const ENDPOINT_STATS: &str = "/api/v1/stats";

// --- Internal Endpoints ---

/// Drops the receiving node's own namespace of a topic, without routing (DELETE).
pub const ENDPOINT_INTERNAL_TOPIC: &str = "/internal/topics/:topic";

// --- Data Transfer Objects ---

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl ApiResponse<()> {
    /// Success without a payload.
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PurgeResponse {
    pub removed: Vec<PurgedContext>,
}
