//! Audio service aggregate
//!
//! Owns the per-session playlist registry and the service-level playback
//! state. The registry is the only way playlist ids resolve to instances:
//! repeated lookups of one id always return the same playlist, and decode
//! routines resolve references through it rather than through any global
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use super::{AudioFormat, ChangeBus, LoopMode, ModelEvent, PlayState, Playlist, Song};

pub struct AudioService {
    bus: Arc<ChangeBus>,
    registry: HashMap<Uuid, Playlist>,
    playlist_ids: Vec<Uuid>,
    current_playlist: Uuid,
    play_state: PlayState,
    volume: f32,
    audio_format: Option<AudioFormat>,
    audio_data: Vec<u8>,
}

impl AudioService {
    pub fn new() -> Self {
        let mut registry = HashMap::new();
        registry.insert(Uuid::nil(), Playlist::new_source());
        Self {
            bus: Arc::new(ChangeBus::new()),
            registry,
            playlist_ids: Vec::new(),
            current_playlist: Uuid::nil(),
            play_state: PlayState::Stopped,
            volume: 1.0,
            audio_format: None,
            audio_data: Vec::new(),
        }
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.audio_format
    }

    pub fn audio_data(&self) -> &[u8] {
        &self.audio_data
    }

    pub fn current_playlist_id(&self) -> Uuid {
        self.current_playlist
    }

    pub fn current_playlist(&self) -> &Playlist {
        // current_playlist is kept pointing at a registered playlist by
        // every mutation path, and the source playlist always exists.
        self.registry
            .get(&self.current_playlist)
            .unwrap_or_else(|| self.source_playlist())
    }

    pub fn source_playlist(&self) -> &Playlist {
        self.registry
            .get(&Uuid::nil())
            .expect("source playlist always registered")
    }

    /// Additional (user-curated) playlist ids, in order.
    pub fn playlist_ids(&self) -> &[Uuid] {
        &self.playlist_ids
    }

    pub fn playlist(&self, id: Uuid) -> Option<&Playlist> {
        self.registry.get(&id)
    }

    /// Registry lookup that creates the playlist on first reference.
    /// Decoding a playlist reference off the wire must resolve to the same
    /// instance as any other reference to that id within this session.
    pub fn get_or_create_playlist(&mut self, id: Uuid) -> &mut Playlist {
        self.registry.entry(id).or_insert_with(|| {
            if id.is_nil() {
                Playlist::new_source()
            } else {
                Playlist::new(id)
            }
        })
    }

    /// Mutate one playlist through its normal setters.
    pub fn update_playlist<R>(
        &mut self,
        id: Uuid,
        update: impl FnOnce(&mut Playlist, &ChangeBus) -> R,
    ) -> Option<R> {
        let bus = self.bus.clone();
        self.registry.get_mut(&id).map(|playlist| update(playlist, &bus))
    }

    /// Like [`Self::update_playlist`] but creates the playlist on demand.
    pub fn update_or_create_playlist<R>(
        &mut self,
        id: Uuid,
        update: impl FnOnce(&mut Playlist, &ChangeBus) -> R,
    ) -> R {
        let bus = self.bus.clone();
        let playlist = self.get_or_create_playlist(id);
        update(playlist, &bus)
    }

    /// Source playlist first, then the additional playlists in order.
    pub fn all_playlists(&self) -> impl Iterator<Item = &Playlist> {
        std::iter::once(self.source_playlist()).chain(
            self.playlist_ids
                .iter()
                .filter_map(move |id| self.registry.get(id)),
        )
    }

    pub fn set_play_state(&mut self, value: PlayState) {
        if self.play_state == value {
            return;
        }
        let old = self.play_state;
        self.play_state = value;
        self.bus.publish(ModelEvent::PlayState { old, new: value });
    }

    pub fn set_volume(&mut self, value: f32) {
        if self.volume == value {
            return;
        }
        let old = self.volume;
        self.volume = value;
        self.bus.publish(ModelEvent::Volume { old, new: value });
    }

    /// Point the service at another playlist. `None` or an unregistered id
    /// snaps back to the source playlist: there is no "no current playlist"
    /// state.
    pub fn set_current_playlist(&mut self, value: Option<Uuid>) {
        let target = value
            .filter(|id| self.registry.contains_key(id))
            .unwrap_or_else(Uuid::nil);
        if self.current_playlist == target {
            return;
        }
        let old = self.current_playlist;
        self.current_playlist = target;
        self.bus
            .publish(ModelEvent::CurrentPlaylist { old, new: target });
    }

    /// Replace the additional-playlist list wholesale. Unknown ids are
    /// registered as empty playlists; their state arrives per-topic.
    pub fn set_playlists(&mut self, value: Vec<Uuid>) {
        if self.playlist_ids == value {
            return;
        }
        for id in &value {
            self.get_or_create_playlist(*id);
        }
        let old = std::mem::replace(&mut self.playlist_ids, value.clone());
        self.bus.publish(ModelEvent::Playlists { old, new: value });
    }

    /// Remove a playlist from the list and the registry. The current
    /// playlist snaps back to the source when it was the one removed.
    pub fn remove_playlist(&mut self, id: Uuid) {
        if id.is_nil() {
            return;
        }
        if self.playlist_ids.contains(&id) {
            let mut ids = self.playlist_ids.clone();
            ids.retain(|other| *other != id);
            self.set_playlists(ids);
        }
        if self.current_playlist == id {
            self.set_current_playlist(None);
        }
        self.registry.remove(&id);
    }

    pub fn set_audio_format(&mut self, value: Option<AudioFormat>) {
        if self.audio_format == value {
            return;
        }
        let old = self.audio_format;
        self.audio_format = value;
        self.bus.publish(ModelEvent::AudioFormat { old, new: value });
    }

    /// Streamed raw audio chunk. Always raises: identical consecutive
    /// chunks are legitimate in a live stream and must still be forwarded.
    pub fn set_audio_data(&mut self, value: Vec<u8>) {
        self.audio_data = value.clone();
        self.bus.publish(ModelEvent::AudioData { data: value });
    }

    /// Explicit skip to the next song, always wrapping.
    pub fn set_next_song(&mut self) {
        self.change_current_song(1);
    }

    /// Explicit skip to the previous song, always wrapping.
    pub fn set_previous_song(&mut self) {
        self.change_current_song(-1);
    }

    fn change_current_song(&mut self, delta: i64) {
        let id = self.current_playlist;
        let (next, _) = self.neighbor_song(delta);
        self.update_playlist(id, |playlist, bus| {
            playlist.set_current_song(next, bus);
            playlist.set_position(chrono::TimeDelta::zero(), bus);
        });
    }

    /// Song `delta` steps away in the current playlist's projection, and
    /// whether the step ran past the end of the sequence.
    fn neighbor_song(&self, delta: i64) -> (Option<Song>, bool) {
        let playlist = self.current_playlist();
        let songs = playlist.all_songs();
        if songs.is_empty() {
            return (None, false);
        }
        let len = songs.len() as i64;
        let index = playlist
            .current_song()
            .and_then(|current| songs.iter().position(|s| s == current))
            .map(|i| i as i64)
            .unwrap_or(0);
        let stepped = index + delta;
        let wrapped = stepped.rem_euclid(len);
        (Some(songs[wrapped as usize].clone()), stepped >= len || stepped < 0)
    }

    /// Auto-advance at the end of the current song, honoring the
    /// playlist's loop mode.
    pub fn continue_playback(&mut self) {
        let id = self.current_playlist;
        let loop_mode = self.current_playlist().loop_mode();
        match loop_mode {
            LoopMode::CurrentSong => {
                // Same song again from the start.
                self.update_playlist(id, |playlist, bus| {
                    playlist.set_position(chrono::TimeDelta::zero(), bus);
                });
            }
            LoopMode::StopCurrentSong => {
                self.change_current_song(1);
                self.set_play_state(PlayState::Stopped);
            }
            LoopMode::Stop => {
                let (next, ran_past_end) = self.neighbor_song(1);
                self.update_playlist(id, |playlist, bus| {
                    playlist.set_current_song(next, bus);
                    playlist.set_position(chrono::TimeDelta::zero(), bus);
                });
                if ran_past_end {
                    self.set_play_state(PlayState::Stopped);
                }
            }
            LoopMode::Next | LoopMode::CurrentPlaylist => {
                self.change_current_song(1);
            }
        }
    }
}

impl Default for AudioService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioService")
            .field("current_playlist", &self.current_playlist)
            .field("play_state", &self.play_state)
            .field("volume", &self.volume)
            .field("playlists", &self.playlist_ids.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;

    fn song(title: &str, path: &str) -> Song {
        Song::new(0, Some(title), None, path)
    }

    fn service_with_songs(titles: &[&str]) -> AudioService {
        let mut service = AudioService::new();
        let songs: Vec<Song> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| song(t, &format!("/{i}")))
            .collect();
        service.update_playlist(Uuid::nil(), |playlist, bus| {
            playlist.set_order(OrderType::Custom, bus);
            playlist.set_songs(songs.clone(), bus);
            playlist.set_current_song(Some(songs[0].clone()), bus);
        });
        service
    }

    #[test]
    fn test_registry_returns_same_instance_per_id() {
        let mut service = AudioService::new();
        let id = Uuid::new_v4();
        service.update_or_create_playlist(id, |playlist, bus| {
            playlist.set_songs(vec![song("A", "/a")], bus);
        });
        // Second lookup sees the first lookup's state.
        assert_eq!(service.get_or_create_playlist(id).songs().len(), 1);
    }

    #[test]
    fn test_current_playlist_snaps_back_to_source() {
        let mut service = AudioService::new();
        let id = Uuid::new_v4();
        service.set_playlists(vec![id]);
        service.set_current_playlist(Some(id));
        assert_eq!(service.current_playlist_id(), id);

        service.set_current_playlist(None);
        assert_eq!(service.current_playlist_id(), Uuid::nil());
    }

    #[test]
    fn test_removing_current_playlist_snaps_to_source() {
        let mut service = AudioService::new();
        let id = Uuid::new_v4();
        service.set_playlists(vec![id]);
        service.set_current_playlist(Some(id));
        service.remove_playlist(id);
        assert_eq!(service.current_playlist_id(), Uuid::nil());
        assert!(service.playlist(id).is_none());
    }

    #[test]
    fn test_all_playlists_yields_source_first() {
        let mut service = AudioService::new();
        let id = Uuid::new_v4();
        service.set_playlists(vec![id]);
        let ids: Vec<Uuid> = service.all_playlists().map(|p| p.id()).collect();
        assert_eq!(ids, vec![Uuid::nil(), id]);
    }

    #[test]
    fn test_next_song_wraps() {
        let mut service = service_with_songs(&["A", "B"]);
        service.set_next_song();
        assert_eq!(
            service.current_playlist().current_song().unwrap().title.as_deref(),
            Some("B")
        );
        service.set_next_song();
        assert_eq!(
            service.current_playlist().current_song().unwrap().title.as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_previous_song_wraps_backwards() {
        let mut service = service_with_songs(&["A", "B", "C"]);
        service.set_previous_song();
        assert_eq!(
            service.current_playlist().current_song().unwrap().title.as_deref(),
            Some("C")
        );
    }

    #[test]
    fn test_continue_with_loop_stop_stops_at_end() {
        let mut service = service_with_songs(&["A", "B"]);
        service.set_play_state(PlayState::Playing);
        service.update_playlist(Uuid::nil(), |playlist, bus| {
            playlist.set_loop(LoopMode::Stop, bus);
        });

        service.continue_playback(); // A -> B, still playing
        assert_eq!(service.play_state(), PlayState::Playing);

        service.continue_playback(); // past the end: wraps and stops
        assert_eq!(service.play_state(), PlayState::Stopped);
        assert_eq!(
            service.current_playlist().current_song().unwrap().title.as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_continue_with_loop_current_song_keeps_song() {
        let mut service = service_with_songs(&["A", "B"]);
        service.update_playlist(Uuid::nil(), |playlist, bus| {
            playlist.set_loop(LoopMode::CurrentSong, bus);
        });
        service.continue_playback();
        assert_eq!(
            service.current_playlist().current_song().unwrap().title.as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_volume_change_emits_event() {
        let mut service = AudioService::new();
        let mut rx = service.bus().subscribe();
        service.set_volume(0.5);
        assert_eq!(
            rx.try_recv().unwrap(),
            ModelEvent::Volume { old: 1.0, new: 0.5 }
        );
        // Unchanged value is a no-op.
        service.set_volume(0.5);
        assert!(rx.try_recv().is_err());
    }
}
