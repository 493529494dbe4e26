//! Playlist entity
//!
//! A playlist is identified by its UUID; the distinguished file-backed
//! source playlist uses the nil UUID and carries a [`SourceExt`] with the
//! filesystem roots and search state (composition instead of a subtype).
//!
//! `songs` insertion order defines the Custom order; `all_songs` is the
//! derived projection recomputed whenever `songs` or `order` changes.

use chrono::TimeDelta;
use rand::seq::SliceRandom;
use uuid::Uuid;

use super::{ChangeBus, LoopMode, ModelEvent, OrderType, Song};

/// Source-playlist extension state.
#[derive(Debug, Clone, Default)]
pub struct SourceExt {
    file_media_sources: Option<Vec<String>>,
    search_key: String,
    is_search_shuffle: bool,
    search_songs: Vec<Song>,
    shuffled_songs: Vec<Song>,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    id: Uuid,
    loop_mode: LoopMode,
    order: OrderType,
    position: TimeDelta,
    duration: TimeDelta,
    current_song: Option<Song>,
    songs: Vec<Song>,
    all_songs: Vec<Song>,
    source: Option<SourceExt>,
}

impl Playlist {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            loop_mode: LoopMode::CurrentPlaylist,
            order: OrderType::ByTitleAndArtist,
            position: TimeDelta::zero(),
            duration: TimeDelta::zero(),
            current_song: None,
            songs: Vec::new(),
            all_songs: Vec::new(),
            source: None,
        }
    }

    /// The file-backed source playlist, always the nil UUID.
    pub fn new_source() -> Self {
        let mut playlist = Self::new(Uuid::nil());
        playlist.source = Some(SourceExt::default());
        playlist
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn order(&self) -> OrderType {
        self.order
    }

    pub fn position(&self) -> TimeDelta {
        self.position
    }

    pub fn duration(&self) -> TimeDelta {
        self.duration
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.current_song.as_ref()
    }

    pub fn songs(&self) -> &[Song] {
        &self.songs
    }

    /// Order-dependent projection of `songs`.
    pub fn all_songs(&self) -> &[Song] {
        &self.all_songs
    }

    pub fn file_media_sources(&self) -> Option<&[String]> {
        self.source
            .as_ref()
            .and_then(|s| s.file_media_sources.as_deref())
    }

    pub fn search_key(&self) -> &str {
        self.source.as_ref().map(|s| s.search_key.as_str()).unwrap_or("")
    }

    pub fn is_search_shuffle(&self) -> bool {
        self.source.as_ref().map(|s| s.is_search_shuffle).unwrap_or(false)
    }

    pub fn search_songs(&self) -> &[Song] {
        self.source.as_ref().map(|s| s.search_songs.as_slice()).unwrap_or(&[])
    }

    pub fn shuffled_songs(&self) -> &[Song] {
        self.source.as_ref().map(|s| s.shuffled_songs.as_slice()).unwrap_or(&[])
    }

    /// Song sequence the search projection filters over.
    pub fn search_base(&self) -> &[Song] {
        if self.is_search_shuffle() {
            self.shuffled_songs()
        } else {
            self.all_songs()
        }
    }

    pub fn set_loop(&mut self, value: LoopMode, bus: &ChangeBus) {
        if self.loop_mode == value {
            return;
        }
        let old = self.loop_mode;
        self.loop_mode = value;
        bus.publish(ModelEvent::Loop { id: self.id, old, new: value });
    }

    pub fn set_order(&mut self, value: OrderType, bus: &ChangeBus) {
        if self.order == value {
            return;
        }
        let old = self.order;
        self.order = value;
        self.all_songs = project_order(&self.songs, self.order);
        bus.publish(ModelEvent::Order { id: self.id, old, new: value });
    }

    pub fn set_position(&mut self, value: TimeDelta, bus: &ChangeBus) {
        if self.position == value {
            return;
        }
        let old = self.position;
        self.position = value;
        bus.publish(ModelEvent::Position { id: self.id, old, new: value });
    }

    pub fn set_duration(&mut self, value: TimeDelta, bus: &ChangeBus) {
        if self.duration == value {
            return;
        }
        let old = self.duration;
        self.duration = value;
        bus.publish(ModelEvent::Duration { id: self.id, old, new: value });
    }

    pub fn set_current_song(&mut self, value: Option<Song>, bus: &ChangeBus) {
        if self.current_song == value {
            return;
        }
        let old = self.current_song.take();
        self.current_song = value.clone();
        bus.publish(ModelEvent::CurrentSong { id: self.id, old, new: value });
    }

    /// Replace the song sequence wholesale. Sequence equality suppresses
    /// the event: decoded payloads always manufacture new vectors, and a
    /// content-identical replacement is not a change.
    pub fn set_songs(&mut self, value: Vec<Song>, bus: &ChangeBus) {
        if self.songs == value {
            return;
        }
        let old = std::mem::replace(&mut self.songs, value);
        self.all_songs = project_order(&self.songs, self.order);
        if let Some(source) = &mut self.source {
            source.shuffled_songs = shuffle_songs(&self.songs);
        }
        bus.publish(ModelEvent::Songs {
            id: self.id,
            old,
            new: self.songs.clone(),
        });
    }

    pub fn set_file_media_sources(&mut self, value: Option<Vec<String>>, bus: &ChangeBus) {
        let id = self.id;
        if let Some(source) = &mut self.source {
            if source.file_media_sources == value {
                return;
            }
            let old = source.file_media_sources.take();
            source.file_media_sources = value.clone();
            bus.publish(ModelEvent::FileMediaSources { id, old, new: value });
        }
    }

    pub fn set_search_key(&mut self, value: String, bus: &ChangeBus) {
        let id = self.id;
        if let Some(source) = &mut self.source {
            if source.search_key == value {
                return;
            }
            let old = std::mem::replace(&mut source.search_key, value.clone());
            bus.publish(ModelEvent::SearchKey { id, old, new: value });
        }
    }

    pub fn set_is_search_shuffle(&mut self, value: bool, bus: &ChangeBus) {
        let id = self.id;
        if let Some(source) = &mut self.source {
            if source.is_search_shuffle == value {
                return;
            }
            source.is_search_shuffle = value;
            bus.publish(ModelEvent::IsSearchShuffle { id, old: !value, new: value });
        }
    }

    /// Store an asynchronously computed search projection.
    ///
    /// Last writer wins: the result is discarded when the key captured at
    /// computation start no longer matches the live key. Returns whether
    /// the result was kept.
    pub fn apply_search_results(
        &mut self,
        captured_key: &str,
        songs: Vec<Song>,
        bus: &ChangeBus,
    ) -> bool {
        let id = self.id;
        let Some(source) = &mut self.source else {
            return false;
        };
        if source.search_key != captured_key {
            return false;
        }
        if source.search_songs != songs {
            source.search_songs = songs.clone();
            bus.publish(ModelEvent::SearchSongs { id, songs });
        }
        true
    }
}

fn project_order(songs: &[Song], order: OrderType) -> Vec<Song> {
    let mut projected = songs.to_vec();
    match order {
        OrderType::ByTitleAndArtist => projected.sort_by(|a, b| {
            let ka = (a.display_title().to_lowercase(), a.artist.clone());
            let kb = (b.display_title().to_lowercase(), b.artist.clone());
            ka.cmp(&kb)
        }),
        OrderType::ByPath => projected.sort_by(|a, b| a.full_path.cmp(&b.full_path)),
        OrderType::Custom => {}
    }
    projected
}

fn shuffle_songs(songs: &[Song]) -> Vec<Song> {
    let mut shuffled = songs.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());
    shuffled
}
