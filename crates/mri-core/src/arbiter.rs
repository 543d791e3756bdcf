use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::shared_state::SharedState;

const GPU_LOCK_KEY: &str = "gpu_locks";
const FREE: &str = "free";

/// Atomically reserves and releases accelerator slots from a fixed pool of
/// `N` integer slot ids. State lives in shared state (`gpu_locks` hash) so
/// ownership survives any single process; every mutation is additionally
/// serialized by a process-local mutex so the scan-then-claim sequence below
/// is not raced by two local callers.
pub struct ResourceArbiter {
    shared: Arc<dyn SharedState>,
    slot_count: usize,
    guard: AsyncMutex<()>,
}

impl ResourceArbiter {
    pub fn new(shared: Arc<dyn SharedState>, slot_count: usize) -> Self {
        Self {
            shared,
            slot_count,
            guard: AsyncMutex::new(()),
        }
    }

    /// Initializes every slot to `free`. Call once at process start.
    pub async fn init(&self) -> CoreResult<()> {
        for slot in 0..self.slot_count {
            self.shared.hset(GPU_LOCK_KEY, &slot.to_string(), FREE.to_string()).await?;
        }
        Ok(())
    }

    /// Scans slots `0..N`; claims and returns the first `free` one, or `None`
    /// if all are owned. Callers are responsible for polling on `None`.
    pub async fn acquire(&self, sid: Uuid, model: &str) -> CoreResult<Option<usize>> {
        let _guard = self.guard.lock().await;
        for slot in 0..self.slot_count {
            let field = slot.to_string();
            let current = self.shared.hget(GPU_LOCK_KEY, &field).await?;
            if current.as_deref() == Some(FREE) || current.is_none() {
                self.shared
                    .hset(GPU_LOCK_KEY, &field, format!("{sid}:{model}"))
                    .await?;
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Polls `acquire` with a sleep between attempts until a slot is granted.
    pub async fn acquire_blocking(&self, sid: Uuid, model: &str, poll_interval: Duration) -> CoreResult<usize> {
        loop {
            if let Some(slot) = self.acquire(sid, model).await? {
                return Ok(slot);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn release(&self, slot: usize) -> CoreResult<()> {
        let _guard = self.guard.lock().await;
        self.shared.hset(GPU_LOCK_KEY, &slot.to_string(), FREE.to_string()).await
    }

    pub async fn snapshot(&self) -> CoreResult<Vec<(usize, String)>> {
        let all = self.shared.hget_all(GPU_LOCK_KEY).await?;
        let mut out: Vec<(usize, String)> = all
            .into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|k| (k, v)))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        Ok(out)
    }
}

/// RAII guard that releases its slot when dropped via an owned async
/// release task, so a step that panics or returns early still frees its
/// accelerator. Callers should still call `release` explicitly on the happy
/// path; this is the backstop for early-return error paths.
pub struct SlotGuard {
    arbiter: Arc<ResourceArbiter>,
    slot: Option<usize>,
}

impl SlotGuard {
    pub fn new(arbiter: Arc<ResourceArbiter>, slot: usize) -> Self {
        Self { arbiter, slot: Some(slot) }
    }

    pub fn slot(&self) -> usize {
        self.slot.expect("slot taken")
    }

    pub async fn release(mut self) -> CoreResult<()> {
        if let Some(slot) = self.slot.take() {
            self.arbiter.release(slot).await?;
        }
        Ok(())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let arbiter = self.arbiter.clone();
            tokio::spawn(async move {
                let _ = arbiter.release(slot).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::InMemorySharedState;

    #[tokio::test]
    async fn acquire_never_double_owns_a_slot() {
        let shared = Arc::new(InMemorySharedState::new());
        let arbiter = ResourceArbiter::new(shared, 1);
        arbiter.init().await.unwrap();

        let sid = Uuid::new_v4();
        let first = arbiter.acquire(sid, "m1").await.unwrap();
        assert_eq!(first, Some(0));

        let second = arbiter.acquire(sid, "m2").await.unwrap();
        assert_eq!(second, None);

        arbiter.release(0).await.unwrap();
        let third = arbiter.acquire(sid, "m2").await.unwrap();
        assert_eq!(third, Some(0));
    }

    #[tokio::test]
    async fn concurrent_acquires_never_collide() {
        let shared = Arc::new(InMemorySharedState::new());
        let arbiter = Arc::new(ResourceArbiter::new(shared, 4));
        arbiter.init().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let arbiter = arbiter.clone();
            handles.push(tokio::spawn(async move {
                arbiter.acquire_blocking(Uuid::new_v4(), &format!("m{i}"), Duration::from_millis(5)).await
            }));
        }

        let mut slots = Vec::new();
        for h in handles {
            slots.push(h.await.unwrap().unwrap());
        }
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }
}
