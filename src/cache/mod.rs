//! # Cache Module
//!
//! Resolution-and-caching engine for the playlist, audio and artist routes.
//!
//! A request for a cacheable resource either returns a previously computed
//! body or triggers exactly one upstream resolution per key, no matter how
//! many clients ask for it at the same time.
//!
//! ## Components
//!
//! - [`store`] - **Cache Store**: sharded, TTL-aware, capacity-bounded LRU
//! - [`singleflight`] - **Singleflight Coordinator**: collapses concurrent
//!   misses for one key into a single resolver call
//! - [`middleware`] - **Cache Middleware**: store lookup, singleflight and
//!   resolver glued together; the only entry point the routes use
//!
//! ## Keys
//!
//! All three namespaces share one store so capacity and eviction are
//! accounted uniformly. A [`CacheKey`] is a namespace tag plus the upstream
//! identifier and renders as `playlist:PLxyz`, `audio:dQw4w9WgXcQ`, ...
//!
//! ```rust
//! use moo_backend::cache::{CacheKey, Namespace};
//!
//! let key = CacheKey::new(Namespace::Artist, "a1").unwrap();
//! assert_eq!(key.to_string(), "artist:a1");
//! assert_eq!("artist:a1".parse::<CacheKey>().unwrap(), key);
//! ```
//!
//! ## Expiry
//!
//! Entries are never served past their TTL. Expired entries are removed
//! lazily on lookup, first in line for eviction, and swept periodically by
//! the service maintenance task.

pub mod middleware;
pub mod singleflight;
pub mod store;

pub use middleware::CacheMiddleware;
pub use singleflight::Singleflight;
pub use store::{CacheMetrics, CacheStore};

use regex::Regex;
use serde::Serialize;
use std::{fmt, str::FromStr, sync::LazyLock};

use crate::error::{ResolveError, Result};

const MAX_ID_LEN: usize = 128;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier pattern compiles"));

/// Namespace de un recurso cacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Playlist,
    Audio,
    Artist,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Playlist, Namespace::Audio, Namespace::Artist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Playlist => "playlist",
            Namespace::Audio => "audio",
            Namespace::Artist => "artist",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| ResolveError::invalid(format!("unknown namespace: {}", s)))
    }
}

/// Clave de caché: namespace + identificador upstream.
///
/// Two requests with equal keys are requests for the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Namespace,
    id: String,
}

impl CacheKey {
    /// Builds a key, rejecting malformed identifiers before any resolver call.
    pub fn new(namespace: Namespace, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self { namespace, id })
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for CacheKey {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, id) = s
            .split_once(':')
            .ok_or_else(|| ResolveError::invalid(format!("malformed cache key: {}", s)))?;
        CacheKey::new(namespace.parse()?, id)
    }
}

/// Valida un identificador upstream (playlist, vídeo, canal).
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ResolveError::invalid("identifier is empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(ResolveError::invalid(format!(
            "identifier longer than {} characters",
            MAX_ID_LEN
        )));
    }
    if !ID_PATTERN.is_match(id) {
        return Err(ResolveError::invalid(format!("malformed identifier: {}", id)));
    }
    Ok(())
}
