//! Sharded Context Vault Library
//!
//! This library crate defines the core modules of a vault node. It serves as the
//! foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of six loosely coupled subsystems:
//!
//! - **`config`**: Parses the static cluster topology (every shard's name, index and
//!   address) from a TOML file.
//! - **`sharding`**: Deterministic key placement. Hashes routing keys onto shard indices and
//!   validates the topology at startup.
//! - **`storage`**: The durable layer. A redb-backed engine holding topics and their
//!   zstd-compressed contexts, with per-topic counters maintained transactionally.
//! - **`cache`**: A byte-bounded, thread-safe LRU cache in front of the storage engine.
//! - **`router`**: The coordinator. Decides whether a request is served locally or
//!   forwarded to its owner, and keeps the cache coherent with storage.
//! - **`api`**: The public HTTP surface (axum). Every node serves every endpoint.

pub mod api;
pub mod cache;
pub mod config;
pub mod router;
pub mod sharding;
pub mod storage;
