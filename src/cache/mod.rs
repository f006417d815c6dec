//! In-Memory Cache Module
//!
//! A byte-bounded LRU cache placed in front of the storage engine. It is never the source
//! of truth: it holds owned copies of values handed to it and is kept coherent by the write
//! paths, which update storage first and the cache second.

pub mod lru;

pub use lru::{CacheError, LruCache, Version, Weigh};
