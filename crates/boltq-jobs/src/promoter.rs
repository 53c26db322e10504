//! Delayed-job promoter: releases scheduled jobs when their time arrives.

use std::sync::Arc;
use std::time::Duration;

use boltq_store::BrokerStore;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::error::Result;
use crate::keys;
use crate::lock::LeaseLock;

/// Periodic task that moves due jobs from the delayed set into a lane.
///
/// Only one promoter may act cluster-wide; instances coordinate through the
/// `lock:promoter` advisory lease, so deploying several is safe but only
/// one does work per tick.
pub struct DelayedJobPromoter<S: BrokerStore + ?Sized> {
    broker: Arc<BrokerClient<S>>,
    lock: Arc<LeaseLock<S>>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BrokerStore + ?Sized + 'static> DelayedJobPromoter<S> {
    /// Create a promoter using the broker's configured tick interval.
    pub fn new(broker: Arc<BrokerClient<S>>) -> Self {
        let config = broker.config();
        let lock = Arc::new(LeaseLock::new(
            broker.store().clone(),
            keys::PROMOTER_LOCK,
            format!("promoter-{}", Uuid::new_v4()),
            config.lock_ttl,
        ));
        let interval = config.promoter_interval;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            broker,
            lock,
            interval,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the periodic task.
    pub async fn start(&self) {
        let broker = self.broker.clone();
        let lock = self.lock.clone();
        let interval = self.interval;
        let mut shutdown = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = tick(&broker, &lock).await {
                            error!(error = %err, "delayed-job promoter tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "delayed job promoter started");
    }

    /// Stop the periodic task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("delayed job promoter stopped");
    }

    /// Run a single promotion pass now. Returns the number of jobs promoted,
    /// or zero when another promoter holds the cluster lease.
    pub async fn run_once(&self) -> Result<usize> {
        tick(&self.broker, &self.lock).await
    }
}

async fn tick<S: BrokerStore + ?Sized + 'static>(
    broker: &BrokerClient<S>,
    lock: &LeaseLock<S>,
) -> Result<usize> {
    if !lock.try_acquire().await? {
        debug!("another promoter holds the lease, skipping tick");
        return Ok(0);
    }

    let outcome = broker.promote_due(Utc::now()).await;
    let _ = lock.release().await;

    let promoted = outcome?;
    if promoted > 0 {
        info!(promoted, "delayed jobs promoted");
    }
    Ok(promoted)
}
