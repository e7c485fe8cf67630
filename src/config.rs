use anyhow::{Context, Result};
use std::time::Duration;

use crate::cache::Namespace;

/// Política de TTL por namespace.
///
/// Artist catalogs change rarely; playlists are edited often, so they get the
/// shortest lifetime. Audio stream URLs expire upstream after a few hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub playlist: Duration,
    pub audio: Duration,
    pub artist: Duration,
}

impl TtlPolicy {
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::Playlist => self.playlist,
            Namespace::Audio => self.audio,
            Namespace::Artist => self.artist,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            playlist: Duration::from_secs(5 * 60),
            audio: Duration::from_secs(60 * 60),
            artist: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Caché
    pub ttl: TtlPolicy,
    pub cache_capacity: usize, // Suma máxima de size hints (bytes)
    pub cache_shards: usize,
    pub cleanup_interval: Duration,

    // Resolver
    pub resolver_timeout: Duration,
    pub ytdlp_path: String,
    pub max_playlist_size: usize,
    pub search_limit: usize,

    // Descargas
    pub download_chunk_size: usize,
    pub download_buffer_chunks: usize,
    pub download_connect_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            // Caché
            ttl: TtlPolicy {
                playlist: env_duration("PLAYLIST_TTL", "5m")?,
                audio: env_duration("AUDIO_TTL", "1h")?,
                artist: env_duration("ARTIST_TTL", "6h")?,
            },
            cache_capacity: std::env::var("CACHE_CAPACITY")
                .unwrap_or_else(|_| "67108864".to_string()) // 64 MiB
                .parse()
                .context("CACHE_CAPACITY")?,
            cache_shards: match std::env::var("CACHE_SHARDS") {
                Ok(val) if !val.trim().is_empty() => val.parse().context("CACHE_SHARDS")?,
                _ => defaults.cache_shards,
            },
            cleanup_interval: env_duration("CACHE_CLEANUP_INTERVAL", "5m")?,

            // Resolver
            resolver_timeout: env_duration("RESOLVER_TIMEOUT", "30s")?,
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
            max_playlist_size: std::env::var("MAX_PLAYLIST_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("MAX_PLAYLIST_SIZE")?,
            search_limit: std::env::var("SEARCH_LIMIT")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("SEARCH_LIMIT")?,

            // Descargas
            download_chunk_size: std::env::var("DOWNLOAD_CHUNK_SIZE")
                .unwrap_or_else(|_| "65536".to_string())
                .parse()
                .context("DOWNLOAD_CHUNK_SIZE")?,
            download_buffer_chunks: std::env::var("DOWNLOAD_BUFFER_CHUNKS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("DOWNLOAD_BUFFER_CHUNKS")?,
            download_connect_timeout: env_duration("DOWNLOAD_CONNECT_TIMEOUT", "15s")?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache capacity, chunk size and buffer depth must be > 0
    /// - Every TTL and timeout must be non-zero
    /// - The shard count must be a power of two greater than one
    /// - Playlist and search limits must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            anyhow::bail!("Cache capacity must be greater than 0");
        }

        if self.cache_shards < 2 || !self.cache_shards.is_power_of_two() {
            anyhow::bail!(
                "Cache shards must be a power of two greater than 1, got: {}",
                self.cache_shards
            );
        }

        for (name, ttl) in [
            ("PLAYLIST_TTL", self.ttl.playlist),
            ("AUDIO_TTL", self.ttl.audio),
            ("ARTIST_TTL", self.ttl.artist),
            ("CACHE_CLEANUP_INTERVAL", self.cleanup_interval),
            ("RESOLVER_TIMEOUT", self.resolver_timeout),
            ("DOWNLOAD_CONNECT_TIMEOUT", self.download_connect_timeout),
        ] {
            if ttl.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.download_chunk_size == 0 {
            anyhow::bail!("Download chunk size must be greater than 0");
        }

        if self.download_buffer_chunks == 0 {
            anyhow::bail!("Download buffer must hold at least one chunk");
        }

        if self.max_playlist_size == 0 || self.search_limit == 0 {
            anyhow::bail!("Playlist and search limits must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Cache: {} bytes, {} shards, sweep every {}\n  \
            TTL: playlist {}, audio {}, artist {}\n  \
            Resolver: {} (timeout {}), playlist max {}, search limit {}\n  \
            Download: {} byte chunks, {} buffered, connect timeout {}",
            self.cache_capacity,
            self.cache_shards,
            humantime::format_duration(self.cleanup_interval),
            humantime::format_duration(self.ttl.playlist),
            humantime::format_duration(self.ttl.audio),
            humantime::format_duration(self.ttl.artist),
            self.ytdlp_path,
            humantime::format_duration(self.resolver_timeout),
            self.max_playlist_size,
            self.search_limit,
            self.download_chunk_size,
            self.download_buffer_chunks,
            humantime::format_duration(self.download_connect_timeout),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            cache_capacity: 64 * 1024 * 1024,
            cache_shards: (num_cpus::get() * 4).max(2).next_power_of_two(),
            cleanup_interval: Duration::from_secs(5 * 60),

            resolver_timeout: Duration::from_secs(30),
            ytdlp_path: "yt-dlp".to_string(),
            max_playlist_size: 100,
            search_limit: 20,

            download_chunk_size: 64 * 1024,
            download_buffer_chunks: 8,
            download_connect_timeout: Duration::from_secs(15),
        }
    }
}

fn env_duration(name: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("{} is not a duration: {}", name, raw))
}
