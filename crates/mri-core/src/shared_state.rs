use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::{CoreError, CoreResult};

/// The sole cross-process coordination medium: key/value, list, hash, and
/// set operations used for job queues, per-job status, per-model progress,
/// and the SSE event buffer. Any backend satisfying this contract qualifies;
/// `InMemorySharedState` is the dependency-free default and `RedisSharedState`
/// (behind the `redis-backend` feature) is the reference production backend.
#[async_trait]
pub trait SharedState: Send + Sync {
    async fn set(&self, key: &str, value: String) -> CoreResult<()>;
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn delete(&self, key: &str) -> CoreResult<()>;
    async fn set_nx(&self, key: &str, value: String) -> CoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;

    async fn rpush(&self, key: &str, value: String) -> CoreResult<()>;
    async fn lpop(&self, key: &str) -> CoreResult<Option<String>>;
    async fn blpop(&self, key: &str, timeout: Duration) -> CoreResult<Option<String>>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CoreResult<Vec<String>>;
    async fn llen(&self, key: &str) -> CoreResult<i64>;

    async fn hset(&self, key: &str, field: &str, value: String) -> CoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>>;
    async fn hget_all(&self, key: &str) -> CoreResult<HashMap<String, String>>;

    async fn sadd(&self, key: &str, member: String) -> CoreResult<()>;
    async fn spop(&self, key: &str) -> CoreResult<Option<String>>;
    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;
}

#[derive(Default)]
struct Store {
    kv: HashMap<String, (String, Option<std::time::Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

/// In-process backend used for tests and single-binary deployments. Mirrors
/// the key-family convention of the reference Redis backend so the two are
/// interchangeable behind `SharedState`.
pub struct InMemorySharedState {
    store: Mutex<Store>,
    notify: Notify,
}

impl Default for InMemorySharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedState {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            notify: Notify::new(),
        }
    }

    fn expired(entry: &(String, Option<std::time::Instant>)) -> bool {
        matches!(entry.1, Some(deadline) if deadline <= std::time::Instant::now())
    }
}

#[async_trait]
impl SharedState for InMemorySharedState {
    async fn set(&self, key: &str, value: String) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.kv.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.kv.get(key) {
            if Self::expired(entry) {
                store.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.0.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.kv.remove(key);
        store.lists.remove(key);
        store.hashes.remove(key);
        store.sets.remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: String) -> CoreResult<bool> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.kv.get(key) {
            if !Self::expired(entry) {
                return Ok(false);
            }
        }
        store.kv.insert(key.to_string(), (value, None));
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.kv.get_mut(key) {
            entry.1 = Some(std::time::Instant::now() + ttl);
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: String) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.lists.entry(key.to_string()).or_default().push_back(value);
        drop(store);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lpop(&self, key: &str) -> CoreResult<Option<String>> {
        let mut store = self.store.lock().await;
        Ok(store.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> CoreResult<Option<String>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(v) = self.lpop(key).await? {
                return Ok(Some(v));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CoreResult<Vec<String>> {
        let store = self.store.lock().await;
        let Some(list) = store.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (start, stop) = (norm(start), norm(stop));
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

    async fn llen(&self, key: &str) -> CoreResult<i64> {
        let store = self.store.lock().await;
        Ok(store.lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: String) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.sets.entry(key.to_string()).or_default().insert(member);
        Ok(())
    }

    async fn spop(&self, key: &str) -> CoreResult<Option<String>> {
        let mut store = self.store.lock().await;
        let Some(set) = store.sets.get_mut(key) else {
            return Ok(None);
        };
        let member = set.iter().next().cloned();
        if let Some(ref m) = member {
            set.remove(m);
        }
        Ok(member)
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let store = self.store.lock().await;
        Ok(store.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    use super::*;
    use redis::AsyncCommands;

    /// Reference production backend, per spec §4.3.
    pub struct RedisSharedState {
        manager: redis::aio::ConnectionManager,
    }

    impl RedisSharedState {
        pub async fn connect(host: &str, port: u16) -> CoreResult<Self> {
            let client = redis::Client::open(format!("redis://{host}:{port}"))
                .map_err(|e| CoreError::SharedState(e.to_string()))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| CoreError::SharedState(e.to_string()))?;
            Ok(Self { manager })
        }
    }

    fn shared_err(e: redis::RedisError) -> CoreError {
        CoreError::SharedState(e.to_string())
    }

    #[async_trait]
    impl SharedState for RedisSharedState {
        async fn set(&self, key: &str, value: String) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.set::<_, _, ()>(key, value).await.map_err(shared_err)
        }

        async fn get(&self, key: &str) -> CoreResult<Option<String>> {
            let mut conn = self.manager.clone();
            conn.get(key).await.map_err(shared_err)
        }

        async fn delete(&self, key: &str) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.del::<_, ()>(key).await.map_err(shared_err)
        }

        async fn set_nx(&self, key: &str, value: String) -> CoreResult<bool> {
            let mut conn = self.manager.clone();
            conn.set_nx(key, value).await.map_err(shared_err)
        }

        async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.expire::<_, ()>(key, ttl.as_secs() as i64).await.map_err(shared_err)
        }

        async fn rpush(&self, key: &str, value: String) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.rpush::<_, _, ()>(key, value).await.map_err(shared_err)
        }

        async fn lpop(&self, key: &str) -> CoreResult<Option<String>> {
            let mut conn = self.manager.clone();
            conn.lpop(key, None).await.map_err(shared_err)
        }

        async fn blpop(&self, key: &str, timeout: Duration) -> CoreResult<Option<String>> {
            let mut conn = self.manager.clone();
            let result: Option<(String, String)> = conn
                .blpop(key, timeout.as_secs_f64())
                .await
                .map_err(shared_err)?;
            Ok(result.map(|(_, v)| v))
        }

        async fn lrange(&self, key: &str, start: i64, stop: i64) -> CoreResult<Vec<String>> {
            let mut conn = self.manager.clone();
            conn.lrange(key, start as isize, stop as isize).await.map_err(shared_err)
        }

        async fn llen(&self, key: &str) -> CoreResult<i64> {
            let mut conn = self.manager.clone();
            conn.llen(key).await.map_err(shared_err)
        }

        async fn hset(&self, key: &str, field: &str, value: String) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.hset::<_, _, _, ()>(key, field, value).await.map_err(shared_err)
        }

        async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>> {
            let mut conn = self.manager.clone();
            conn.hget(key, field).await.map_err(shared_err)
        }

        async fn hget_all(&self, key: &str) -> CoreResult<HashMap<String, String>> {
            let mut conn = self.manager.clone();
            conn.hgetall(key).await.map_err(shared_err)
        }

        async fn sadd(&self, key: &str, member: String) -> CoreResult<()> {
            let mut conn = self.manager.clone();
            conn.sadd::<_, _, ()>(key, member).await.map_err(shared_err)
        }

        async fn spop(&self, key: &str) -> CoreResult<Option<String>> {
            let mut conn = self.manager.clone();
            conn.spop(key).await.map_err(shared_err)
        }

        async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
            let mut conn = self.manager.clone();
            conn.smembers(key).await.map_err(shared_err)
        }
    }
}

pub fn shared_state_from_config(_host: &str, _port: u16) -> Arc<dyn SharedState> {
    Arc::new(InMemorySharedState::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_atomic_single_writer() {
        let store = InMemorySharedState::new();
        assert!(store.set_nx("k", "a".into()).await.unwrap());
        assert!(!store.set_nx("k", "b".into()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".into()));
    }

    #[tokio::test]
    async fn rpush_lpop_preserves_fifo_order() {
        let store = InMemorySharedState::new();
        store.rpush("q", "1".into()).await.unwrap();
        store.rpush("q", "2".into()).await.unwrap();
        assert_eq!(store.lpop("q").await.unwrap(), Some("1".into()));
        assert_eq!(store.lpop("q").await.unwrap(), Some("2".into()));
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blpop_wakes_on_push() {
        let store = Arc::new(InMemorySharedState::new());
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop("q", Duration::from_secs(2)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush("q", "hello".into()).await.unwrap();
        let got = reader.await.unwrap();
        assert_eq!(got, Some("hello".into()));
    }

    #[tokio::test]
    async fn queue_once_each_item_popped_by_a_single_consumer() {
        let store = Arc::new(InMemorySharedState::new());
        for i in 0..50 {
            store.rpush("q", i.to_string()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut popped = Vec::new();
                while let Some(v) = store.lpop("q").await.unwrap() {
                    popped.push(v);
                }
                popped
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(all, expected);
    }
}
