use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use super::{CacheKey, CacheStore, Singleflight};
use crate::error::{ResolveError, Result};
use crate::sources::{self, MediaResolver};

/// Cache Middleware: store + singleflight + resolver.
///
/// The single entry point the playlist, audio and artist routes go through.
/// Values are cached as the serialized JSON body, so a hit is handed back to
/// the dispatch layer without touching the resolver or re-serializing.
pub struct CacheMiddleware<R: ?Sized> {
    store: Arc<CacheStore<Bytes>>,
    flights: Singleflight<CacheKey, Bytes>,
    resolver: Arc<R>,
    timeout: Duration,
}

impl<R> CacheMiddleware<R>
where
    R: MediaResolver + ?Sized + 'static,
{
    pub fn new(store: Arc<CacheStore<Bytes>>, resolver: Arc<R>, timeout: Duration) -> Self {
        Self {
            store,
            flights: Singleflight::new(),
            resolver,
            timeout,
        }
    }

    /// Devuelve el cuerpo cacheado de `key` o lo resuelve una sola vez.
    ///
    /// Failures reach every concurrent waiter and are never cached.
    pub async fn handle(&self, key: CacheKey, ttl: Duration) -> Result<Bytes> {
        if let Some(body) = self.store.get(&key) {
            return Ok(body);
        }

        let store = Arc::clone(&self.store);
        let resolver = Arc::clone(&self.resolver);
        let flight_key = key.clone();

        self.flights
            .execute(key, self.timeout, move || async move {
                // A flight that finished just before this one started has
                // already populated the store
                if let Some(body) = store.peek(&flight_key) {
                    return Ok(body);
                }

                info!("🔄 Resolviendo {}", flight_key);
                let resolved = sources::resolve(resolver.as_ref(), &flight_key).await?;
                let body = Bytes::from(serde_json::to_vec(&resolved).map_err(|e| {
                    ResolveError::upstream(format!("could not serialize {}: {}", flight_key, e))
                })?);

                let size_hint = body.len();
                store.put(flight_key.clone(), body.clone(), ttl, size_hint);
                debug!("💾 {} resuelto ({} bytes)", flight_key, size_hint);
                Ok(body)
            })
            .await
    }

    /// Invalida activamente una entrada.
    pub fn invalidate(&self, key: &CacheKey) {
        self.store.invalidate(key);
    }

    pub fn store(&self) -> &Arc<CacheStore<Bytes>> {
        &self.store
    }

    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }
}
