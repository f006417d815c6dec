use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::path::Path;
use uuid::Uuid;

use super::compression::{self, CompressionError};
use super::types::{Context, StoredContext, Topic};

/// Topic name -> bincode `Topic`.
const TOPICS: TableDefinition<&str, &[u8]> = TableDefinition::new("topics");
const TOPIC_TABLE_PREFIX: &str = "topic:";
const MAX_NAME_LEN: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("invalid {kind}: {reason}")]
    InvalidName { kind: &'static str, reason: String },

    #[error("storage engine error: {0}")]
    Engine(#[from] redb::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::TopicNotFound(_) | StoreError::ContextNotFound(_)
        )
    }
}

macro_rules! engine_error {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for StoreError {
                fn from(err: $source) -> Self {
                    StoreError::Engine(err.into())
                }
            }
        )*
    };
}

engine_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Transactional topic/context store backed by a single redb file.
///
/// Shared between all request tasks of a node. redb serialises write transactions and
/// lets readers proceed on a snapshot, which is what keeps the per-topic counters exact
/// without an external lock.
pub struct Storage {
    db: Database,
    compression_level: i32,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_level(path, compression::DEFAULT_LEVEL)
    }

    pub fn open_with_level(path: impl AsRef<Path>, compression_level: i32) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;

        let txn = db.begin_write()?;
        {
            txn.open_table(TOPICS)?;
        }
        txn.commit()?;

        tracing::info!("Opened storage at {}", path.as_ref().display());

        Ok(Self {
            db,
            compression_level,
        })
    }

    /// Creates the topic namespace. An existing topic is returned unchanged.
    pub fn create_topic(&self, name: &str) -> Result<Topic, StoreError> {
        validate_name("topic name", name)?;

        let txn = self.db.begin_write()?;
        let (topic, created) = {
            let mut topics = txn.open_table(TOPICS)?;

            match load_topic(&topics, name)? {
                Some(existing) => (existing, false),
                None => {
                    let topic = Topic::new(name, Utc::now());
                    topics.insert(name, bincode::serialize(&topic)?.as_slice())?;

                    let table_name = topic_table_name(name);
                    txn.open_table(contexts_table(&table_name))?;
                    (topic, true)
                }
            }
        };

        if created {
            txn.commit()?;
            tracing::info!("Created topic {}", name);
        } else {
            txn.abort()?;
            tracing::debug!("Topic {} already exists", name);
        }

        Ok(topic)
    }

    pub fn get_topic(&self, name: &str) -> Result<Topic, StoreError> {
        let txn = self.db.begin_read()?;
        let topics = txn.open_table(TOPICS)?;

        load_topic(&topics, name)?.ok_or_else(|| StoreError::TopicNotFound(name.to_string()))
    }

    /// Stores a context and bumps the topic's metadata in the same transaction.
    ///
    /// Returns the context as readers will see it: id assigned, timestamps stamped,
    /// content uncompressed. Overwriting an existing id keeps its `created_at` and
    /// does not change `context_count`.
    pub fn store_context(&self, topic: &str, mut context: Context) -> Result<Context, StoreError> {
        if context.metadata.id.is_empty() {
            context.metadata.id = Uuid::new_v4().to_string();
        }
        let id = context.metadata.id.clone();
        validate_name("context id", &id)?;

        let now = Utc::now();
        let payload = compression::compress(&context.content.data, self.compression_level)?;

        context.metadata.topic = topic.to_string();
        context.metadata.created_at = now;
        context.metadata.last_accessed = now;
        context.metadata.size = payload.original_len as u64;
        context.content.compressed = false;

        let txn = self.db.begin_write()?;
        {
            let mut topics = txn.open_table(TOPICS)?;
            let mut meta = load_topic(&topics, topic)?
                .ok_or_else(|| StoreError::TopicNotFound(topic.to_string()))?;

            let table_name = topic_table_name(topic);
            let mut contexts = txn.open_table(contexts_table(&table_name))?;

            let previous = contexts.get(id.as_str())?.map(|guard| guard.value().to_vec());
            match previous {
                Some(bytes) => {
                    let previous: StoredContext = bincode::deserialize(&bytes)?;
                    context.metadata.created_at = previous.metadata.created_at;
                }
                None => meta.context_count += 1,
            }

            let record = StoredContext {
                metadata: context.metadata.clone(),
                compressed: true,
                payload: payload.bytes,
            };
            contexts.insert(id.as_str(), bincode::serialize(&record)?.as_slice())?;

            meta.last_updated = now;
            topics.insert(topic, bincode::serialize(&meta)?.as_slice())?;
        }
        txn.commit()?;

        tracing::debug!("Stored context {} in topic {}", id, topic);
        Ok(context)
    }

    /// Reads and decompresses a context, then persists a `last_accessed` refresh.
    ///
    /// The refresh runs in its own write transaction after the read. If it fails the
    /// read still succeeds and the failure is logged.
    pub fn get_context(&self, topic: &str, id: &str) -> Result<Context, StoreError> {
        let mut context = self.read_context(topic, id)?;

        let now = Utc::now();
        match self.touch_context(topic, id, now) {
            Ok(true) => context.metadata.last_accessed = now,
            Ok(false) => {
                tracing::debug!("Context {} vanished before access refresh", id);
            }
            Err(e) => {
                tracing::warn!("Failed to refresh access time of {}/{}: {}", topic, id, e);
            }
        }

        Ok(context)
    }

    /// Rewrites `last_accessed` of a still-present record. Returns `false` when the topic
    /// or the record no longer exists; never recreates either.
    pub fn touch_context(&self, topic: &str, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let touched = {
            let topics = txn.open_table(TOPICS)?;

            if load_topic(&topics, topic)?.is_none() {
                false
            } else {
                let table_name = topic_table_name(topic);
                let mut contexts = txn.open_table(contexts_table(&table_name))?;

                let existing = contexts.get(id)?.map(|guard| guard.value().to_vec());
                match existing {
                    Some(bytes) => {
                        let mut record: StoredContext = bincode::deserialize(&bytes)?;
                        record.metadata.last_accessed = at;
                        contexts.insert(id, bincode::serialize(&record)?.as_slice())?;
                        true
                    }
                    None => false,
                }
            }
        };

        if touched {
            txn.commit()?;
        } else {
            txn.abort()?;
        }

        Ok(touched)
    }

    /// Removes a context. Deleting an id that is not present is a successful no-op.
    pub fn delete_context(&self, topic: &str, id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut topics = txn.open_table(TOPICS)?;
            let mut meta = load_topic(&topics, topic)?
                .ok_or_else(|| StoreError::TopicNotFound(topic.to_string()))?;

            let table_name = topic_table_name(topic);
            let mut contexts = txn.open_table(contexts_table(&table_name))?;
            let removed = contexts.remove(id)?.is_some();

            if removed {
                meta.context_count = meta.context_count.saturating_sub(1);
                meta.last_updated = Utc::now();
                topics.insert(topic, bincode::serialize(&meta)?.as_slice())?;
            }
            removed
        };

        if removed {
            txn.commit()?;
            tracing::debug!("Deleted context {} from topic {}", id, topic);
        } else {
            txn.abort()?;
        }

        Ok(())
    }

    pub fn list_topics(&self) -> Result<Vec<Topic>, StoreError> {
        let txn = self.db.begin_read()?;
        let topics = txn.open_table(TOPICS)?;

        let mut out = Vec::new();
        for entry in topics.iter()? {
            let (_, value) = entry?;
            out.push(bincode::deserialize(value.value())?);
        }
        Ok(out)
    }

    /// Returns every context of a topic, decompressed, in id order.
    pub fn list_contexts(&self, topic: &str) -> Result<Vec<Context>, StoreError> {
        let txn = self.db.begin_read()?;
        let topics = txn.open_table(TOPICS)?;
        if load_topic(&topics, topic)?.is_none() {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }

        let table_name = topic_table_name(topic);
        let contexts = match txn.open_table(contexts_table(&table_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in contexts.iter()? {
            let (_, value) = entry?;
            out.push(decode_context(value.value())?);
        }
        Ok(out)
    }

    /// Drops a topic together with all of its contexts. Returns the removed context ids.
    pub fn delete_topic(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let table_name = topic_table_name(name);

        let txn = self.db.begin_write()?;
        let ids = {
            let mut topics = txn.open_table(TOPICS)?;
            let existed = topics.remove(name)?.is_some();
            if !existed {
                return Err(StoreError::TopicNotFound(name.to_string()));
            }

            let contexts = txn.open_table(contexts_table(&table_name))?;
            let mut ids = Vec::new();
            for entry in contexts.iter()? {
                let (key, _) = entry?;
                ids.push(key.value().to_string());
            }
            ids
        };
        txn.delete_table(contexts_table(&table_name))?;
        txn.commit()?;

        tracing::info!("Deleted topic {} ({} contexts)", name, ids.len());
        Ok(ids)
    }

    /// Deletes, in one transaction, every context whose id matches `should_remove`,
    /// across all topics. Returns the removed `(topic, id)` pairs.
    pub fn purge_contexts<F>(&self, should_remove: F) -> Result<Vec<(String, String)>, StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let now = Utc::now();
        let mut removed = Vec::new();

        let txn = self.db.begin_write()?;
        {
            let mut topics = txn.open_table(TOPICS)?;
            let names = topics
                .iter()?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<Result<Vec<_>, _>>()?;

            for name in names {
                let table_name = topic_table_name(&name);
                let mut contexts = txn.open_table(contexts_table(&table_name))?;

                let mut doomed = Vec::new();
                for entry in contexts.iter()? {
                    let (key, _) = entry?;
                    if should_remove(key.value()) {
                        doomed.push(key.value().to_string());
                    }
                }
                if doomed.is_empty() {
                    continue;
                }

                for id in &doomed {
                    contexts.remove(id.as_str())?;
                }

                if let Some(mut meta) = load_topic(&topics, &name)? {
                    meta.context_count = meta.context_count.saturating_sub(doomed.len() as u64);
                    meta.last_updated = now;
                    topics.insert(name.as_str(), bincode::serialize(&meta)?.as_slice())?;
                }

                removed.extend(doomed.into_iter().map(|id| (name.clone(), id)));
            }
        }
        txn.commit()?;

        if !removed.is_empty() {
            tracing::info!("Purged {} contexts", removed.len());
        }
        Ok(removed)
    }

    fn read_context(&self, topic: &str, id: &str) -> Result<Context, StoreError> {
        let txn = self.db.begin_read()?;
        let topics = txn.open_table(TOPICS)?;
        if load_topic(&topics, topic)?.is_none() {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }

        let table_name = topic_table_name(topic);
        let contexts = match txn.open_table(contexts_table(&table_name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(StoreError::ContextNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = contexts
            .get(id)?
            .map(|guard| guard.value().to_vec())
            .ok_or_else(|| StoreError::ContextNotFound(id.to_string()))?;

        decode_context(&bytes)
    }
}

fn topic_table_name(topic: &str) -> String {
    format!("{}{}", TOPIC_TABLE_PREFIX, topic)
}

fn contexts_table(table_name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(table_name)
}

fn load_topic<T>(topics: &T, name: &str) -> Result<Option<Topic>, StoreError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match topics.get(name)? {
        Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
        None => Ok(None),
    }
}

fn decode_context(bytes: &[u8]) -> Result<Context, StoreError> {
    let record: StoredContext = bincode::deserialize(bytes)?;
    Ok(record.into_context()?)
}

/// Topic names and context ids double as URL path segments.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), StoreError> {
    let reason = if name.is_empty() {
        Some("must not be empty".to_string())
    } else if name.len() > MAX_NAME_LEN {
        Some(format!("longer than {} bytes", MAX_NAME_LEN))
    } else if name.contains('/') {
        Some("must not contain '/'".to_string())
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName { kind, reason }),
        None => Ok(()),
    }
}
