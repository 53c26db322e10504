//! In-memory store implementation for tests and local development.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::Result;
use crate::BrokerStore;

/// Capacity of each subscriber channel. Publish never blocks; messages to a
/// full subscriber are dropped, matching the fire-and-forget contract.
const SUBSCRIBER_BUFFER: usize = 256;

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeSet<(i64, String)>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl Inner {
    /// Read-through access to a string entry, evicting it when expired.
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        if self.strings.get(key).is_some_and(StringEntry::is_expired) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

/// Deterministic in-memory [`BrokerStore`].
///
/// Single-process only; every worker and periodic task in a test shares one
/// instance through an `Arc`. TTLs are honoured lazily at read time.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    list_notify: Notify,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.live_string(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.strings.remove(key).is_some())
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.live_string(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let matches = inner.live_string(key).is_some_and(|e| e.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn push_left(&self, key: &str, value: String) -> Result<u64> {
        let len = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let list = inner.lists.entry(key.to_string()).or_default();
            list.push_front(value);
            list.len() as u64
        };
        self.list_notify.notify_waiters();
        Ok(len)
    }

    async fn pop_right(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.lists.get_mut(key).and_then(VecDeque::pop_back))
    }

    async fn pop_right_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking so a concurrent push
            // between the check and the await is not missed.
            let notified = self.list_notify.notified();
            {
                let mut inner = self.inner.lock().expect("store mutex poisoned");
                for key in keys {
                    if let Some(value) = inner.lists.get_mut(key).and_then(VecDeque::pop_back) {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let resolve = |idx: i64| -> i64 {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx.min(len - 1)
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (resolve(start), resolve(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let set = inner.zsets.entry(key.to_string()).or_default();
        // A member is unique within the set regardless of score.
        set.retain(|(_, m)| m != &member);
        set.insert((score, member));
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.zsets.get(key).map_or_else(Vec::new, |set| {
            set.iter()
                .take_while(|(score, _)| *score <= max)
                .map(|(_, member)| member.clone())
                .collect()
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        Ok(set.len() < before)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.zsets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(senders) = inner.subscribers.get_mut(channel) {
            // Drop closed subscribers; a full buffer loses the message.
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let _ = tx.try_send(payload.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn list_push_pop_is_fifo() {
        let store = MemoryStore::new();
        store.push_left("q", "first".into()).await.unwrap();
        store.push_left("q", "second".into()).await.unwrap();
        store.push_left("q", "third".into()).await.unwrap();

        assert_eq!(store.pop_right("q").await.unwrap().as_deref(), Some("first"));
        assert_eq!(store.pop_right("q").await.unwrap().as_deref(), Some("second"));
        assert_eq!(store.pop_right("q").await.unwrap().as_deref(), Some("third"));
        assert_eq!(store.pop_right("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_pop_prefers_earlier_keys() {
        let store = MemoryStore::new();
        store.push_left("low", "l".into()).await.unwrap();
        store.push_left("high", "h".into()).await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let (key, value) = store
            .pop_right_blocking(&keys, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "high");
        assert_eq!(value, "h");
    }

    #[tokio::test]
    async fn blocking_pop_times_out_when_empty() {
        let store = MemoryStore::new();
        let keys = vec!["empty".to_string()];
        let got = store
            .pop_right_blocking(&keys, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let keys = vec!["q".to_string()];
                store
                    .pop_right_blocking(&keys, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_left("q", "woke".into()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.1, "woke");
    }

    #[tokio::test]
    async fn ttl_expires_strings() {
        let store = MemoryStore::new();
        store
            .put("k", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_if_absent_claims_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.put_if_absent("lock", "a".into(), ttl).await.unwrap());
        assert!(!store.put_if_absent("lock", "b".into(), ttl).await.unwrap());

        // Release is conditional on the holder.
        assert!(!store.delete_if_equals("lock", "b").await.unwrap());
        assert!(store.delete_if_equals("lock", "a").await.unwrap());
        assert!(store.put_if_absent("lock", "b".into(), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn zset_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", 30, "c".into()).await.unwrap();
        store.zadd("z", 10, "a".into()).await.unwrap();
        store.zadd("z", 20, "b".into()).await.unwrap();

        assert_eq!(store.zrange_by_score("z", 20).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.zcard("z").await.unwrap(), 3);

        assert!(store.zrem("z", "a").await.unwrap());
        assert!(!store.zrem("z", "a").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zadd_updates_score_of_existing_member() {
        let store = MemoryStore::new();
        store.zadd("z", 10, "m".into()).await.unwrap();
        store.zadd("z", 99, "m".into()).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert!(store.zrange_by_score("z", 50).await.unwrap().is_empty());
        assert_eq!(store.zrange_by_score("z", 100).await.unwrap(), vec!["m"]);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();
        store.publish("events", "hello".into()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        store.publish("nobody", "lost".into()).await.unwrap();
    }

    #[tokio::test]
    async fn scan_prefix_filters_keys() {
        let store = MemoryStore::new();
        store.put("workflow:a", "1".into(), None).await.unwrap();
        store.put("workflow:b", "2".into(), None).await.unwrap();
        store.put("task:c", "3".into(), None).await.unwrap();

        let keys = store.scan_prefix("workflow:").await.unwrap();
        assert_eq!(keys, vec!["workflow:a", "workflow:b"]);
    }
}
