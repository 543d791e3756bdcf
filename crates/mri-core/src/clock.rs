use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Abstracted time and identity source so tests can control both.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn new_id(&self) -> Uuid;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Deterministic clock for tests: fixed `now`, sequential ids.
    pub struct FixedClock {
        pub fixed_now: Mutex<DateTime<Utc>>,
        counter: AtomicU64,
    }

    impl FixedClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self {
                fixed_now: Mutex::new(now),
                counter: AtomicU64::new(0),
            }
        }

        pub fn advance(&self, duration: chrono::Duration) {
            let mut guard = self.fixed_now.lock().unwrap();
            *guard += duration;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.fixed_now.lock().unwrap()
        }

        fn new_id(&self) -> Uuid {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Uuid::from_u128(n as u128)
        }
    }
}
