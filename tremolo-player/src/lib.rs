//! Tremolo player
//!
//! The playback-facing half of tremolo: the state-synchronization
//! subsystem (topics, echo locks, publish queue, TCP transport, the
//! client and server communicator roles), the staged service build
//! lifecycle with its status tokens, the playback seam, and the launch
//! configuration the CLI feeds in.

pub mod build;
pub mod config;
pub mod error;
pub mod player;
pub mod status;
pub mod sync;

pub use error::{Error, Result};
