use crate::units::StateKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// KeyLocks serializes work per `StateKey`. Waiters for the same key are served in the order they
/// started waiting (tokio's mutex is fair); different keys never block each other.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Arc<Mutex<HashMap<StateKey, Arc<AsyncMutex<()>>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, key: &StateKey) -> KeyLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };

        let guard = lock.lock_owned().await;

        KeyLockGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

pub(crate) struct KeyLockGuard {
    key: StateKey,
    locks: Arc<Mutex<HashMap<StateKey, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());

        // The map and our guard hold one reference each. Anything above that is a waiter.
        let idle = locks
            .get(&self.key)
            .map(|lock| Arc::strong_count(lock) <= 2)
            .unwrap_or(false);
        if idle {
            locks.remove(&self.key);
        }

        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(state_key: &str) -> StateKey {
        StateKey {
            context: "!r".into(),
            pdu_type: "topic".into(),
            state_key: state_key.into(),
        }
    }

    #[tokio::test]
    async fn same_key_is_mutually_exclusive_and_fifo() {
        let locks = Arc::new(KeyLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_section = Arc::new(AtomicUsize::new(0));

        let first = locks.lock(&key("")).await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            let in_section = in_section.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(&key("")).await;
                assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
            // Let task `i` start waiting before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&key("a")).await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&key("b"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.tracked_keys(), 2);
    }
}
