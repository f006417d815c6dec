use crate::config::ShardConfig;
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("shard {0} is not found")]
    MissingShard(usize),

    #[error("shard index {0} is assigned more than once")]
    DuplicateIndex(usize),

    #[error("shard {0:?} was not found")]
    UnknownShard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTable {
    count: usize,
    current_index: usize,
    /// Indexed by shard; complete for `0..count` once constructed.
    addresses: Vec<String>,
}

impl ShardTable {
    /// Converts and verifies the list of shards from the config into a routing table.
    pub fn from_shards(shards: &[ShardConfig], current_name: &str) -> Result<Self, TopologyError> {
        let count = shards.len();
        let mut addresses = HashMap::with_capacity(count);
        let mut current_index = None;

        for shard in shards {
            if addresses.insert(shard.idx, shard.address.clone()).is_some() {
                return Err(TopologyError::DuplicateIndex(shard.idx));
            }
            if shard.name == current_name {
                current_index = Some(shard.idx);
            }
        }

        if let Some(missing) = (0..count).find(|idx| !addresses.contains_key(idx)) {
            return Err(TopologyError::MissingShard(missing));
        }

        let current_index =
            current_index.ok_or_else(|| TopologyError::UnknownShard(current_name.to_string()))?;

        let mut addresses: Vec<(usize, String)> = addresses.into_iter().collect();
        addresses.sort_by_key(|(idx, _)| *idx);
        let addresses = addresses.into_iter().map(|(_, address)| address).collect();

        Ok(Self {
            count,
            current_index,
            addresses,
        })
    }

    /// Returns the shard number for the corresponding key.
    pub fn index(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.count as u64) as usize
    }

    pub fn is_local(&self, key: &str) -> bool {
        self.index(key) == self.current_index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn address(&self, index: usize) -> Option<&str> {
        self.addresses.get(index).map(String::as_str)
    }

    /// Shard index and address of the node owning `key`.
    pub fn owner(&self, key: &str) -> (usize, &str) {
        let index = self.index(key);
        (index, &self.addresses[index])
    }
}
