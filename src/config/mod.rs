//! Cluster Configuration Module
//!
//! Loads the static cluster topology from a TOML file. The file lists every shard
//! in the cluster exactly once:
//!
//! ```toml
//! [[shards]]
//! name = "shard-0"
//! idx = 0
//! address = "127.0.0.1:8080"
//! ```
//!
//! Validation of the topology itself (gaps, duplicates, unknown current shard) is the
//! job of [`crate::sharding::ShardTable`]; this module only parses.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single shard entry as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardConfig {
    /// Human readable shard name, matched against `--shard` at startup.
    pub name: String,
    /// Position of the shard in the hash ring, `0..count`.
    pub idx: usize,
    /// `host:port` of the node serving this shard.
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
}

impl Config {
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}
