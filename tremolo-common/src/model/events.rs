//! Change-notification bus
//!
//! Every mutated property emits exactly one [`ModelEvent`] carrying the
//! old and new value. Two delivery paths hang off the bus:
//!
//! - a synchronous observer list, invoked on the mutating task before the
//!   setter returns — the replication layer uses this so its echo check
//!   runs while the inbound topic lock is still held;
//! - a broadcast channel for async consumers (search worker, player
//!   bridge), which may lag and only need eventual delivery.

use std::sync::RwLock;

use chrono::TimeDelta;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{AudioFormat, LoopMode, OrderType, PlayState, Song};

/// Typed property-change event with the old and new value.
///
/// Playlist-scoped variants carry the playlist id; service-level variants
/// do not. `AudioData` carries only the new chunk: a live stream has no
/// meaningful previous value.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    PlayState { old: PlayState, new: PlayState },
    Volume { old: f32, new: f32 },
    CurrentPlaylist { old: Uuid, new: Uuid },
    Playlists { old: Vec<Uuid>, new: Vec<Uuid> },
    AudioFormat { old: Option<AudioFormat>, new: Option<AudioFormat> },
    AudioData { data: Vec<u8> },
    Loop { id: Uuid, old: LoopMode, new: LoopMode },
    Order { id: Uuid, old: OrderType, new: OrderType },
    Position { id: Uuid, old: TimeDelta, new: TimeDelta },
    Duration { id: Uuid, old: TimeDelta, new: TimeDelta },
    CurrentSong { id: Uuid, old: Option<Song>, new: Option<Song> },
    Songs { id: Uuid, old: Vec<Song>, new: Vec<Song> },
    FileMediaSources { id: Uuid, old: Option<Vec<String>>, new: Option<Vec<String>> },
    SearchKey { id: Uuid, old: String, new: String },
    IsSearchShuffle { id: Uuid, old: bool, new: bool },
    /// Derived search projection finished recomputing. Local only,
    /// never replicated.
    SearchSongs { id: Uuid, songs: Vec<Song> },
}

impl ModelEvent {
    /// Playlist id for playlist-scoped events, `None` for service-level.
    pub fn playlist_id(&self) -> Option<Uuid> {
        match self {
            ModelEvent::Loop { id, .. }
            | ModelEvent::Order { id, .. }
            | ModelEvent::Position { id, .. }
            | ModelEvent::Duration { id, .. }
            | ModelEvent::CurrentSong { id, .. }
            | ModelEvent::Songs { id, .. }
            | ModelEvent::FileMediaSources { id, .. }
            | ModelEvent::SearchKey { id, .. }
            | ModelEvent::IsSearchShuffle { id, .. }
            | ModelEvent::SearchSongs { id, .. } => Some(*id),
            _ => None,
        }
    }
}

type Observer = Box<dyn Fn(&ModelEvent) + Send + Sync>;

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Fan-out point for model change events.
pub struct ChangeBus {
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    next_observer: std::sync::atomic::AtomicU64,
    events: broadcast::Sender<ModelEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            observers: RwLock::new(Vec::new()),
            next_observer: std::sync::atomic::AtomicU64::new(0),
            events,
        }
    }

    /// Register a synchronous observer, called on the mutating task.
    /// Observers must be fast and must not mutate the model re-entrantly.
    pub fn observe(&self, observer: impl Fn(&ModelEvent) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(
            self.next_observer
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.observers
            .write()
            .expect("observer list poisoned")
            .push((id, Box::new(observer)));
        id
    }

    /// Remove a previously registered observer.
    pub fn unobserve(&self, id: ObserverId) {
        self.observers
            .write()
            .expect("observer list poisoned")
            .retain(|(other, _)| *other != id);
    }

    /// Subscribe to the async event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ModelEvent) {
        for (_, observer) in self.observers.read().expect("observer list poisoned").iter() {
            observer(&event);
        }
        // Ignore send errors (no receivers is OK)
        let _ = self.events.send(event);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sync_observer_runs_before_publish_returns() {
        let bus = ChangeBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.observe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(ModelEvent::Volume { old: 0.5, new: 0.7 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscriber_receives_event() {
        let bus = ChangeBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ModelEvent::Volume { old: 0.5, new: 0.7 });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ModelEvent::Volume { old: 0.5, new: 0.7 });
    }
}
