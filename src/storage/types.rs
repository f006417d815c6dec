use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::compression::{self, CompressionError};

/// Kind of data a context carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    #[default]
    Conversation,
    Code,
    #[serde(rename = "doc", alias = "document")]
    Document,
}

/// A named collection of contexts.
///
/// `context_count` is a running counter maintained in the same transaction as every
/// context insert or delete in this topic's namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context_count: u64,
}

impl Topic {
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            created_at: now,
            last_updated: now,
            context_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextMetadata {
    /// Unique within the topic. Generated on store when empty.
    pub id: String,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Byte length of the uncompressed JSON payload.
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: ContextType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Content {
    pub data: Value,
    pub compressed: bool,
}

/// A single stored item, in the shape clients send and receive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Context {
    pub metadata: ContextMetadata,
    pub content: Content,
}

impl Context {
    pub fn new(kind: ContextType, data: Value) -> Self {
        Self {
            metadata: ContextMetadata {
                kind,
                ..Default::default()
            },
            content: Content {
                data,
                compressed: false,
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// On-disk representation of a context. Never leaves the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredContext {
    pub metadata: ContextMetadata,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl StoredContext {
    pub fn into_context(self) -> Result<Context, CompressionError> {
        let data = if self.compressed {
            compression::decompress(&self.payload)?
        } else {
            serde_json::from_slice(&self.payload)?
        };

        Ok(Context {
            metadata: self.metadata,
            content: Content {
                data,
                compressed: false,
            },
        })
    }
}
