//! Playback seam
//!
//! Real audio engines live outside this crate. [`ServicePlayer`] is the
//! boundary they implement; the bridge task feeds it model changes from
//! the broadcast stream so an engine never touches the replication layer.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use tremolo_common::model::{AudioService, ModelEvent, PlayState, Song};

/// Hooks a playback engine implements. All methods have no-op defaults;
/// an engine overrides what it cares about. Called from the bridge task
/// in event order, so implementations should return quickly.
pub trait ServicePlayer: Send + Sync {
    fn play_state_changed(&self, _state: PlayState) {}
    fn volume_changed(&self, _volume: f32) {}
    fn current_song_changed(&self, _song: Option<&Song>) {}
    fn audio_received(&self, _data: &[u8]) {}
}

/// Player used when no audio backend is wired in. State still replicates;
/// nothing reaches a sound device.
#[derive(Debug, Default)]
pub struct NoopPlayer;

impl ServicePlayer for NoopPlayer {
    fn play_state_changed(&self, state: PlayState) {
        debug!("player: play state -> {:?}", state);
    }

    fn audio_received(&self, data: &[u8]) {
        debug!("player: {} audio bytes dropped", data.len());
    }
}

/// Forward model events into the player until the bus goes away.
pub async fn run_player_bridge(service: Arc<RwLock<AudioService>>, player: Arc<dyn ServicePlayer>) {
    let mut events = service.read().await.bus().subscribe();
    loop {
        match events.recv().await {
            Ok(event) => dispatch(&*player, &event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("player bridge lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn dispatch(player: &dyn ServicePlayer, event: &ModelEvent) {
    match event {
        ModelEvent::PlayState { new, .. } => player.play_state_changed(*new),
        ModelEvent::Volume { new, .. } => player.volume_changed(*new),
        ModelEvent::CurrentSong { new, .. } => player.current_song_changed(new.as_ref()),
        ModelEvent::AudioData { data } => player.audio_received(data),
        _ => {}
    }
}
