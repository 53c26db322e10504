//! Shared key-value store abstraction for the BoltQ job queue.
//!
//! The queue core coordinates exclusively through a single shared store that
//! offers atomic list, sorted-set, string, and pub/sub primitives. This crate
//! defines that surface as the [`BrokerStore`] trait and ships two
//! implementations:
//!
//! - [`MemoryStore`]: in-process, deterministic, used by tests and local
//!   development.
//! - [`RedisStore`]: the deployment backend, one Redis instance shared by all
//!   producers and workers.
//!
//! All operations are atomic from the caller's perspective; the queue core
//! never needs a transaction that spans more than one call.

#![warn(missing_docs)]

mod error;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Atomic primitives of the shared broker store.
///
/// Semantics follow the Redis commands they map onto: lists are FIFO when
/// pushed on the left and popped on the right, sorted sets order members by
/// an integer score, and pub/sub delivery is fire-and-forget.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    /// Check connectivity. Callers treat failure at startup as fatal.
    async fn ping(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Set `key` to `value`, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Read the value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Set `key` only if it does not already hold a value (lease acquire).
    ///
    /// Returns `true` when the key was claimed.
    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `expected` (lease release).
    ///
    /// Returns `true` when the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// Push `value` onto the left of the list at `key`. Returns the new length.
    async fn push_left(&self, key: &str, value: String) -> Result<u64>;

    /// Pop one element from the right of the list at `key`.
    async fn pop_right(&self, key: &str) -> Result<Option<String>>;

    /// Block up to `timeout` waiting for an element on any of `keys`.
    ///
    /// When several lists are non-empty the first key in `keys` wins; this is
    /// how the queue core expresses strict priority across lanes. Returns the
    /// source key together with the popped element, or `None` on timeout.
    async fn pop_right_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    /// Length of the list at `key` (0 when absent).
    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Elements of the list at `key` in the inclusive index range.
    ///
    /// Indexing follows Redis `LRANGE`: 0 is the head (most recently pushed),
    /// negative indices count from the tail.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    /// Add `member` with `score` to the sorted set at `key`.
    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<()>;

    /// Members with score less than or equal to `max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, max: i64) -> Result<Vec<String>>;

    /// Remove `member` from the sorted set at `key`. Returns whether it existed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Number of members in the sorted set at `key`.
    async fn zcard(&self, key: &str) -> Result<u64>;

    // ------------------------------------------------------------------
    // Keyspace
    // ------------------------------------------------------------------

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish `payload` on `channel`. Delivery is fire-and-forget; slow or
    /// absent subscribers lose messages.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to `channel`. The receiver yields raw payloads until dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}
