//! # Moo Backend
//!
//! Media metadata and audio backend behind the Moo player.
//!
//! ## Features
//!
//! - **Cached routes**: playlist, audio and artist payloads are resolved once
//!   per key and served from a shared, capacity-bounded TTL cache
//! - **Request collapsing**: concurrent misses for one key share a single
//!   upstream resolution
//! - **Streaming downloads**: audio bytes are relayed to the client as they
//!   arrive, never buffered whole
//! - **yt-dlp resolver** for search, video, playlist, audio and channel data

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod service;
pub mod sources;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ResolveError, Result};
pub use service::MediaService;
