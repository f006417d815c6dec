use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::forward::{ForwardError, ForwardRequest, ForwardedResponse, Forwarder};
use crate::cache::{CacheError, LruCache, Weigh};
use crate::sharding::ShardTable;
use crate::storage::{Context, Storage, StoreError, Topic};

/// Timestamps, size, type and flags of a cached context.
const CONTEXT_OVERHEAD: usize = 64;

impl Weigh for Context {
    fn weight(&self) -> usize {
        self.metadata.id.len()
            + self.metadata.topic.len()
            + self.metadata.size as usize
            + CONTEXT_OVERHEAD
    }
}

/// Where a request for a given routing key has to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote { shard: usize, address: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurgedContext {
    pub topic: String,
    pub id: String,
}

/// Outcome of dropping a topic across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicRemoval {
    pub name: String,
    pub removed_contexts: usize,
    /// Shards whose local namespace of the topic could not be dropped.
    #[serde(default)]
    pub unreachable_shards: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    pub shard_index: usize,
    pub shard_count: usize,
    pub topics: usize,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub cache_capacity: usize,
}

/// Per-node request coordinator.
///
/// Owns the routing table, the local store and the read-through cache. Callers ask
/// [`Coordinator::route`] first and either forward or call one of the local operations;
/// the local operations assume the request belongs to this shard.
pub struct Coordinator {
    shards: Arc<ShardTable>,
    storage: Arc<Storage>,
    cache: LruCache<Context>,
    forwarder: Forwarder,
}

impl Coordinator {
    pub fn new(
        shards: ShardTable,
        storage: Arc<Storage>,
        cache: LruCache<Context>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            shards: Arc::new(shards),
            storage,
            cache,
            forwarder,
        }
    }

    pub fn shards(&self) -> &ShardTable {
        &self.shards
    }

    pub fn cache(&self) -> &LruCache<Context> {
        &self.cache
    }

    pub fn route(&self, key: &str) -> Route {
        let (shard, address) = self.shards.owner(key);
        if shard == self.shards.current_index() {
            Route::Local
        } else {
            Route::Remote {
                shard,
                address: address.to_string(),
            }
        }
    }

    pub async fn forward(
        &self,
        shard: usize,
        address: &str,
        request: ForwardRequest,
    ) -> Result<ForwardedResponse, CoordinatorError> {
        Ok(self.forwarder.forward(shard, address, request).await?)
    }

    /// Runs a storage call on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&Storage) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        Ok(tokio::task::spawn_blocking(move || op(&storage)).await??)
    }

    // --- Topics ---

    pub async fn create_topic(&self, name: String) -> Result<Topic, CoordinatorError> {
        self.blocking(move |storage| storage.create_topic(&name)).await
    }

    pub async fn get_topic(&self, name: String) -> Result<Topic, CoordinatorError> {
        self.blocking(move |storage| storage.get_topic(&name)).await
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>, CoordinatorError> {
        self.blocking(|storage| storage.list_topics()).await
    }

    /// Drops the topic on its home shard, then the local namespaces other shards hold for
    /// it. Peers that cannot be reached are reported, not retried.
    pub async fn delete_topic(&self, name: String) -> Result<TopicRemoval, CoordinatorError> {
        let mut removal = self.delete_local_topic(name.clone()).await?;

        for shard in (0..self.shards.count()).filter(|&shard| shard != self.shards.current_index()) {
            let Some(address) = self.shards.address(shard) else {
                continue;
            };
            match self.forwarder.drop_topic(shard, address, &name).await {
                Ok(removed) => removal.removed_contexts += removed,
                Err(e) => {
                    tracing::warn!("Topic {} may linger on shard {}: {}", name, shard, e);
                    removal.unreachable_shards.push(shard);
                }
            }
        }

        Ok(removal)
    }

    /// Drops this node's namespace of the topic and evicts its contexts from the cache.
    pub async fn delete_local_topic(&self, name: String) -> Result<TopicRemoval, CoordinatorError> {
        let topic = name.clone();
        let removed = self.blocking(move |storage| storage.delete_topic(&topic)).await?;
        for id in &removed {
            self.cache.remove(id);
        }
        Ok(TopicRemoval {
            name,
            removed_contexts: removed.len(),
            unreachable_shards: Vec::new(),
        })
    }

    // --- Contexts ---

    pub async fn store_context(
        &self,
        topic: String,
        mut context: Context,
    ) -> Result<Context, CoordinatorError> {
        if context.metadata.id.is_empty() {
            context.metadata.id = self.local_context_id();
        }

        // Contexts are placed by id, so this shard may hold contexts of a topic whose
        // home is elsewhere. The local namespace is created once the home confirms the topic.
        let satellite = !self.shards.is_local(&topic);
        if satellite && !self.has_local_topic(&topic).await? {
            let (shard, address) = self.shards.owner(&topic);
            if !self.forwarder.topic_exists(shard, address, &topic).await? {
                return Err(StoreError::TopicNotFound(topic).into());
            }
        }

        let version = self.cache.version(context.id());
        let stored = self
            .blocking(move |storage| {
                if satellite {
                    storage.create_topic(&topic)?;
                }
                storage.store_context(&topic, context)
            })
            .await?;

        if let Err(CacheError::Full { size, capacity }) =
            self.cache.put_if_unchanged(stored.id(), stored.clone(), version)
        {
            tracing::debug!("Context {} not cached ({} bytes, capacity {})", stored.id(), size, capacity);
        }
        Ok(stored)
    }

    pub async fn get_context(&self, topic: String, id: String) -> Result<Context, CoordinatorError> {
        let now = Utc::now();
        let hit = self.cache.update_if_present(&id, |cached| {
            if cached.metadata.topic != topic {
                return false;
            }
            cached.metadata.last_accessed = now;
            true
        });

        if let Some(cached) = hit {
            tracing::debug!("Cache hit for context {}", id);
            let storage = self.storage.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = storage.touch_context(&topic, &id, now) {
                    tracing::warn!("Failed to refresh access time of {}/{}: {}", topic, id, e);
                }
            });
            return Ok(cached);
        }

        let version = self.cache.version(&id);
        let context = self
            .blocking(move |storage| storage.get_context(&topic, &id))
            .await?;

        if let Err(CacheError::Full { size, capacity }) =
            self.cache.fill(context.id(), context.clone(), version)
        {
            tracing::debug!("Context {} not cached ({} bytes, capacity {})", context.id(), size, capacity);
        }
        Ok(context)
    }

    pub async fn list_contexts(&self, topic: String) -> Result<Vec<Context>, CoordinatorError> {
        self.blocking(move |storage| storage.list_contexts(&topic)).await
    }

    pub async fn delete_context(&self, topic: String, id: String) -> Result<(), CoordinatorError> {
        let key = id.clone();
        self.blocking(move |storage| storage.delete_context(&topic, &id))
            .await?;
        self.cache.remove(&key);
        Ok(())
    }

    // --- Maintenance ---

    /// Removes every local context whose id is owned by another shard.
    pub async fn purge_foreign_contexts(&self) -> Result<Vec<PurgedContext>, CoordinatorError> {
        let shards = self.shards.clone();
        let removed = self
            .blocking(move |storage| storage.purge_contexts(|id| !shards.is_local(id)))
            .await?;

        Ok(removed
            .into_iter()
            .map(|(topic, id)| {
                self.cache.remove(&id);
                PurgedContext { topic, id }
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<NodeStats, CoordinatorError> {
        let topics = self.list_topics().await?.len();
        Ok(NodeStats {
            shard_index: self.shards.current_index(),
            shard_count: self.shards.count(),
            topics,
            cache_entries: self.cache.count(),
            cache_bytes: self.cache.size(),
            cache_capacity: self.cache.capacity(),
        })
    }

    /// Generates a context id that this shard owns.
    fn local_context_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.shards.is_local(&id) {
                return id;
            }
        }
    }

    async fn has_local_topic(&self, topic: &str) -> Result<bool, CoordinatorError> {
        let topic = topic.to_string();
        match self.blocking(move |storage| storage.get_topic(&topic)).await {
            Ok(_) => Ok(true),
            Err(CoordinatorError::Store(StoreError::TopicNotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
