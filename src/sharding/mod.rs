//! Shard Routing Module
//!
//! Maps keys to the shard that owns them and validates the static cluster topology.
//!
//! ## Core Concepts
//! - **Hashing**: A key's raw bytes are hashed with seedless XXH3-64 and reduced modulo the
//!   shard count. Every node computes the same function, so any node can route any key.
//! - **Topology**: Built once at startup from the config file. Gaps in the index range or an
//!   unknown current shard name are fatal; the table is immutable afterwards.

pub mod partitioner;

pub use partitioner::{ShardTable, TopologyError};
