//! Coalescing publish queue
//!
//! All outbound publishes funnel through one queue per communicator.
//! Rapid repeated updates to the same topic collapse onto the pending
//! entry (latest value wins, original queue position kept) so position
//! ticks during playback cannot queue unboundedly. Distinct topics keep
//! FIFO dispatch order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::transport::WireMessage;

#[derive(Debug, Default)]
struct Pending {
    messages: HashMap<String, WireMessage>,
    order: VecDeque<String>,
}

/// Single-writer publish queue with per-topic coalescing.
#[derive(Debug, Default)]
pub struct PublishQueue {
    pending: Mutex<Pending>,
    nonempty: Notify,
}

impl PublishQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. An already-pending topic is overwritten in place
    /// and keeps its queue position; a new topic goes to the back and
    /// wakes the dispatcher. Callable from synchronous observer context.
    pub fn enqueue(&self, message: WireMessage) {
        let mut pending = self.pending.lock().expect("publish queue poisoned");
        let topic = message.topic.clone();
        if pending.messages.insert(topic.clone(), message).is_none() {
            pending.order.push_back(topic);
            drop(pending);
            self.nonempty.notify_one();
        }
    }

    /// Whether a message for `topic` is sitting in the queue, not yet
    /// handed to the dispatcher. Distinguishes "queued" from "in flight,
    /// awaiting ack" on the retry path.
    pub fn is_enqueued(&self, topic: &str) -> bool {
        self.pending
            .lock()
            .expect("publish queue poisoned")
            .messages
            .contains_key(topic)
    }

    /// Number of pending topics.
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .expect("publish queue poisoned")
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least one message is pending, then pop the oldest
    /// topic.
    pub async fn dequeue(&self) -> WireMessage {
        loop {
            let notified = self.nonempty.notified();
            {
                let mut pending = self.pending.lock().expect("publish queue poisoned");
                if let Some(topic) = pending.order.pop_front() {
                    let message = pending
                        .messages
                        .remove(&topic)
                        .expect("order list out of step with message map");
                    return message;
                }
            }
            notified.await;
        }
    }
}
