//! Request Coordination Module
//!
//! Decides for every request whether this node serves it or forwards it, and serves the
//! local ones through the cache and the storage engine.
//!
//! ## Core Concepts
//! - **Routing keys**: Topic-level operations route by topic name, context operations by
//!   context id. Listing topics, stats and purge only ever concern the receiving node.
//! - **Forwarding**: A remote request is replayed verbatim on its owner with a single attempt.
//!   Forwarded requests carry [`forward::FORWARDED_HEADER`], so a request is never forwarded
//!   twice.
//! - **Satellite topics**: Since contexts are placed by id, a node can hold contexts of a
//!   topic homed on another shard. Such topics are created on demand once the home shard
//!   confirms the topic exists, and their counters only count the contexts stored on that
//!   node. Deleting a topic drops it on every shard.
//! - **Cache coherence**: Every local write updates storage first and then the cache. Deletes
//!   take the affected ids out of the cache. Cache writes that follow a storage call are
//!   checked against the key's version taken before it.

pub mod coordinator;
pub mod forward;

pub use coordinator::{Coordinator, CoordinatorError, NodeStats, PurgedContext, Route, TopicRemoval};
pub use forward::{
    DEFAULT_FORWARD_TIMEOUT, FORWARDED_HEADER, ForwardError, ForwardRequest, ForwardedResponse,
    Forwarder,
};
