use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// IdGenerator hands out ids that are unique within the causal namespace of one home server.
///
/// An id is `{nonce}-{counter}`. The nonce is drawn once per generator, so two processes (or a
/// restarted process) never share a prefix in practice, and the counter keeps ids handed out by
/// the same process distinct.
pub struct IdGenerator {
    nonce: u64,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_nonce(rand::thread_rng().gen())
    }

    pub(crate) fn with_nonce(nonce: u64) -> Self {
        IdGenerator {
            nonce,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{}", self.nonce, count)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdGenerator({:016x})", self.nonce)
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
