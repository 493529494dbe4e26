//! Sync countdown list
//!
//! During the client sync stage every subscribed retained topic must
//! deliver one initial message before the communicator may be exposed as
//! open. The countdown tracks the outstanding topics; it can grow while
//! syncing when a `Playlists` update introduces playlists whose topics are
//! subscribed on the fly.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SyncCountdown {
    outstanding: Mutex<HashSet<String>>,
    drained: Notify,
}

impl SyncCountdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add topics still awaiting their initial message.
    pub fn add<I>(&self, topics: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.outstanding
            .lock()
            .expect("countdown poisoned")
            .extend(topics);
    }

    /// Mark a topic as delivered. Returns true when this emptied the list.
    pub fn deliver(&self, topic: &str) -> bool {
        let mut outstanding = self.outstanding.lock().expect("countdown poisoned");
        if outstanding.remove(topic) && outstanding.is_empty() {
            drop(outstanding);
            self.drained.notify_waiters();
            return true;
        }
        false
    }

    pub fn remaining(&self) -> usize {
        self.outstanding.lock().expect("countdown poisoned").len()
    }

    /// Wait until every awaited topic has delivered. No internal timeout:
    /// callers race this against their status token.
    pub async fn wait_empty(&self) {
        loop {
            let drained = self.drained.notified();
            if self.remaining() == 0 {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_once_all_topics_deliver() {
        let countdown = Arc::new(SyncCountdown::new());
        countdown.add(["A".to_owned(), "B".to_owned()]);

        let waiter = {
            let countdown = countdown.clone();
            tokio::spawn(async move { countdown.wait_empty().await })
        };

        assert!(!countdown.deliver("A"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert!(countdown.deliver("B"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("countdown should drain")
            .unwrap();
    }

    #[tokio::test]
    async fn test_growth_while_waiting_keeps_countdown_alive() {
        let countdown = Arc::new(SyncCountdown::new());
        countdown.add(["A".to_owned()]);
        countdown.add(["B".to_owned()]);

        countdown.deliver("A");
        assert_eq!(countdown.remaining(), 1);

        countdown.deliver("B");
        countdown.wait_empty().await; // resolves immediately
    }

    #[tokio::test]
    async fn test_unknown_topic_delivery_is_ignored() {
        let countdown = SyncCountdown::new();
        countdown.add(["A".to_owned()]);
        assert!(!countdown.deliver("NotAwaited"));
        assert_eq!(countdown.remaining(), 1);
    }
}
