//! Replicated entity model
//!
//! The state graph mirrored between player instances: songs, playlists
//! (with the file-backed source playlist as a composition extension), and
//! the `AudioService` aggregate that owns the playlist registry. Every
//! mutable property goes through a setter that suppresses no-op writes and
//! emits a typed change event on the aggregate's [`ChangeBus`].

mod events;
mod playlist;
mod search;
mod service;
mod song;

pub use events::{ChangeBus, ModelEvent, ObserverId};
pub use playlist::{Playlist, SourceExt};
pub use search::{compute_search_songs, run_search_worker};
pub use service::AudioService;
pub use song::Song;

use crate::codec::DecodeError;

/// Playback state of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

impl PlayState {
    pub fn to_wire(self) -> i32 {
        match self {
            PlayState::Stopped => 0,
            PlayState::Playing => 1,
            PlayState::Paused => 2,
        }
    }

    pub fn from_wire(tag: i32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(PlayState::Stopped),
            1 => Ok(PlayState::Playing),
            2 => Ok(PlayState::Paused),
            _ => Err(DecodeError::UnknownTag {
                kind: "PlayState",
                tag,
            }),
        }
    }
}

/// What happens when playback runs past the current song
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Next,
    Stop,
    CurrentPlaylist,
    CurrentSong,
    StopCurrentSong,
}

impl LoopMode {
    pub fn to_wire(self) -> i32 {
        match self {
            LoopMode::Next => 0,
            LoopMode::Stop => 1,
            LoopMode::CurrentPlaylist => 2,
            LoopMode::CurrentSong => 3,
            LoopMode::StopCurrentSong => 4,
        }
    }

    pub fn from_wire(tag: i32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(LoopMode::Next),
            1 => Ok(LoopMode::Stop),
            2 => Ok(LoopMode::CurrentPlaylist),
            3 => Ok(LoopMode::CurrentSong),
            4 => Ok(LoopMode::StopCurrentSong),
            _ => Err(DecodeError::UnknownTag {
                kind: "LoopMode",
                tag,
            }),
        }
    }
}

/// Projection order for a playlist's song sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    ByTitleAndArtist,
    ByPath,
    Custom,
}

impl OrderType {
    pub fn to_wire(self) -> i32 {
        match self {
            OrderType::ByTitleAndArtist => 0,
            OrderType::ByPath => 1,
            OrderType::Custom => 2,
        }
    }

    pub fn from_wire(tag: i32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(OrderType::ByTitleAndArtist),
            1 => Ok(OrderType::ByPath),
            2 => Ok(OrderType::Custom),
            _ => Err(DecodeError::UnknownTag {
                kind: "OrderType",
                tag,
            }),
        }
    }
}

/// Playback format descriptor for the streamed audio relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: i32,
    pub channels: i32,
    pub bits_per_sample: i32,
    pub block_align: i32,
    pub avg_bytes_per_sec: i32,
    pub encoding: u16,
}
