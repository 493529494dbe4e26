//! # Tremolo Common Library
//!
//! Shared code for the tremolo player binaries including:
//! - Replicated entity model (songs, playlists, audio service)
//! - Change-notification bus
//! - Wire codec for sync payloads
//! - Configuration loading
//! - Duration/tick utilities

pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod time;

pub use error::{Error, Result};
