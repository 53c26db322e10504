//! Lease-based advisory lock.
//!
//! Mutual exclusion across processes via a single store key: acquisition is
//! an atomic set-if-absent with a TTL, release is conditional on the holder
//! identity, and a crashed holder's lease simply expires. Used per-job by
//! the worker pool and cluster-wide by the delayed-job promoter and the
//! workflow scheduler.

use std::sync::Arc;
use std::time::Duration;

use boltq_store::BrokerStore;
use tracing::debug;

use crate::error::Result;

/// Handle to one advisory lock key.
pub struct LeaseLock<S: BrokerStore + ?Sized> {
    store: Arc<S>,
    key: String,
    holder: String,
    ttl: Duration,
}

impl<S: BrokerStore + ?Sized> LeaseLock<S> {
    /// Create a handle for `key` held as `holder`.
    pub fn new<K, H>(store: Arc<S>, key: K, holder: H, ttl: Duration) -> Self
    where
        K: Into<String>,
        H: Into<String>,
    {
        Self {
            store,
            key: key.into(),
            holder: holder.into(),
            ttl,
        }
    }

    /// Try to acquire the lease. Returns `false` when another holder owns it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let acquired = self
            .store
            .put_if_absent(&self.key, self.holder.clone(), self.ttl)
            .await?;
        if !acquired {
            debug!(key = %self.key, holder = %self.holder, "lease already held");
        }
        Ok(acquired)
    }

    /// Release the lease if this holder still owns it.
    ///
    /// Returns `false` when the lease had already expired or was taken over;
    /// callers treat that as a no-op, not a failure.
    pub async fn release(&self) -> Result<bool> {
        let released = self.store.delete_if_equals(&self.key, &self.holder).await?;
        Ok(released)
    }

    /// The lock key this handle manages.
    pub fn key(&self) -> &str {
        &self.key
    }
}
