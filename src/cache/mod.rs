//! Generation-partitioned response store.
//!
//! This module provides the storage side of the worker:
//! - Snapshots are keyed by normalized request identity (method + URL)
//! - Entries live inside named generations that can be dropped as a whole
//! - Insertion order is tracked so the dynamic generation can be trimmed FIFO

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CachedResponse, RequestKey};
