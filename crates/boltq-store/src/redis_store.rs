//! Redis-backed store implementation.
//!
//! One Redis instance is shared by every producer, worker, and periodic task
//! in the cluster. Non-blocking commands go through a multiplexed
//! [`ConnectionManager`]; blocking pops and subscriptions each take a
//! dedicated connection so they cannot stall the shared pipeline.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::BrokerStore;

/// Capacity of each subscriber channel; see the trait contract on loss.
const SUBSCRIBER_BUFFER: usize = 256;

/// Bound on establishing the initial connection. A host that drops packets
/// instead of refusing them would otherwise hang startup forever.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Conditional delete used for lease release: remove the key only when it
/// still holds the caller's value.
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// [`BrokerStore`] backed by a shared Redis instance.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Fails when the instance is unreachable or does not answer within
    /// [`CONNECT_TIMEOUT`]; callers treat that as fatal at startup.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| StoreError::Timeout {
                duration_ms: CONNECT_TIMEOUT.as_millis() as u64,
            })?
            .map_err(StoreError::from)?;
        debug!(url, "connected to redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl BrokerStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        if pong != "PONG" {
            return Err(StoreError::Backend {
                reason: format!("unexpected PING reply: {pong}"),
            });
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                let _: () = conn.set_ex(key, value, secs).await.map_err(StoreError::from)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(StoreError::from)?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await.map_err(StoreError::from)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = conn.del(key).await.map_err(StoreError::from)?;
        Ok(removed > 0)
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::Script::new(DELETE_IF_EQUALS_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(removed > 0)
    }

    async fn push_left(&self, key: &str, value: String) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.lpush(key, value).await.map_err(StoreError::from)?;
        Ok(len)
    }

    async fn pop_right(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.rpop(key, None).await.map_err(StoreError::from)?;
        Ok(value)
    }

    async fn pop_right_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        // BRPOP parks the connection, so it gets one of its own instead of
        // going through the shared manager.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::from)?;
        let secs = timeout.as_secs_f64().max(0.01);
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(keys)
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(reply)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.llen(key).await.map_err(StoreError::from)?;
        Ok(len)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let items: Vec<String> = conn
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(StoreError::from)?;
        Ok(items)
    }

    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .zrangebyscore(key, "-inf", max)
            .await
            .map_err(StoreError::from)?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = conn.zrem(key, member).await.map_err(StoreError::from)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 = conn.zcard(key).await.map_err(StoreError::from)?;
        Ok(count)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn();
        let _: u64 = conn.publish(channel, payload).await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(StoreError::from)?;
        pubsub.subscribe(channel).await.map_err(StoreError::from)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel, error = %err, "dropping undecodable pubsub message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Receiver dropped; tear down the subscription.
                    break;
                }
            }
        });
        Ok(rx)
    }
}
