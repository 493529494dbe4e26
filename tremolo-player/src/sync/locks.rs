//! Echo-suppression lock table
//!
//! One advisory lock per topic, keyed by the exact payload being applied.
//! The receive path holds the lock across "decode → apply to model" so the
//! setter's own outbound publish can recognize the value it is about to
//! echo and drop it. Locking blocks until the holder releases, then
//! retries; this is a mutual-exclusion queue per topic, not a try-lock.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Per-connection topic lock table.
#[derive(Debug, Default)]
pub struct TopicLocks {
    held: Mutex<HashMap<String, Vec<u8>>>,
    released: Notify,
}

impl TopicLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `topic`, storing `payload` as the expected
    /// value. Waits for the current holder when the topic is taken.
    pub async fn lock(&self, topic: &str, payload: Vec<u8>) {
        let mut payload = Some(payload);
        loop {
            // Register for the release signal before inspecting the map so
            // an unlock between the check and the await cannot be missed.
            let released = self.released.notified();
            {
                let mut held = self.held.lock().expect("lock table poisoned");
                if !held.contains_key(topic) {
                    held.insert(topic.to_owned(), payload.take().expect("payload consumed"));
                    return;
                }
            }
            released.await;
        }
    }

    /// True iff `topic` is locked with exactly this payload. The publish
    /// path uses this to silently drop the echo of a just-applied update
    /// while still letting genuinely new values through.
    pub fn is_locked(&self, topic: &str, payload: &[u8]) -> bool {
        self.held
            .lock()
            .expect("lock table poisoned")
            .get(topic)
            .is_some_and(|expected| expected == payload)
    }

    /// Release the lock for `topic`, waking all waiters. Waking all is the
    /// uniform pulse rule: spuriously woken waiters re-check and sleep
    /// again.
    pub fn unlock(&self, topic: &str) {
        let removed = self
            .held
            .lock()
            .expect("lock table poisoned")
            .remove(topic)
            .is_some();
        if removed {
            self.released.notify_waiters();
        }
    }
}
