//! Durable Storage Module
//!
//! Implements the per-node storage engine on top of `redb`, an embedded ACID key-value store
//! with single-writer transactions and MVCC readers.
//!
//! ## Core Concepts
//! - **Topics**: Named namespaces. Their metadata (timestamps, running context count) lives in
//!   the `topics` table, kept apart from context records so that no context id can ever be
//!   mistaken for a metadata entry.
//! - **Contexts**: Records keyed by id inside the topic's own table (`topic:<name>`).
//! - **Transactions**: Every mutation updates the record and its topic's metadata in one write
//!   transaction, so `context_count` cannot drift from the real number of records.
//! - **Compression**: Context payloads are stored zstd-compressed and decompressed on every
//!   read; callers never observe the compressed form.

pub mod compression;
pub mod engine;
pub mod types;

pub use engine::{Storage, StoreError};
pub use types::{Content, Context, ContextMetadata, ContextType, Topic};
