use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheMetrics, CacheMiddleware, CacheStore, Namespace};
use crate::config::{Config, TtlPolicy};
use crate::download::{ByteSource, DownloadStream, DownloadStreamer, HttpByteSource};
use crate::error::{ResolveError, Result};
use crate::sources::{MediaResolver, VideoDetails, VideoSummary};

const MAX_QUERY_LEN: usize = 256;

/// Fachada que usa la capa de dispatch para las seis rutas.
///
/// `playlist`, `audio` and `artist` go through the cache and return the JSON
/// body; `search` and `video` call the resolver directly; `download` streams.
/// The instance owns its cache: create one per running service and call
/// [`MediaService::shutdown`] when it stops.
pub struct MediaService<R: ?Sized, S: ?Sized> {
    resolver: Arc<R>,
    cache: CacheMiddleware<R>,
    downloads: DownloadStreamer<S>,
    ttl: TtlPolicy,
    resolver_timeout: Duration,
    search_limit: usize,
    shutdown: CancellationToken,
}

impl<R> MediaService<R, HttpByteSource<R>>
where
    R: MediaResolver + ?Sized + 'static,
{
    /// Construye el servicio con descargas HTTP sobre el mismo resolver.
    pub fn from_config(config: &Config, resolver: Arc<R>) -> anyhow::Result<Self> {
        let source = Arc::new(HttpByteSource::new(
            Arc::clone(&resolver),
            config.download_connect_timeout,
        )?);
        Ok(Self::new(config, resolver, source))
    }
}

impl<R, S> MediaService<R, S>
where
    R: MediaResolver + ?Sized + 'static,
    S: ByteSource + ?Sized,
{
    pub fn new(config: &Config, resolver: Arc<R>, source: Arc<S>) -> Self {
        let store = Arc::new(CacheStore::with_shards(config.cache_capacity, config.cache_shards));
        let cache = CacheMiddleware::new(store, Arc::clone(&resolver), config.resolver_timeout);
        let downloads = DownloadStreamer::new(
            source,
            config.download_chunk_size,
            config.download_buffer_chunks,
            config.download_connect_timeout,
        );

        info!(
            "🗄️ Servicio iniciado con {} ({} bytes de caché)",
            resolver.source_name(),
            config.cache_capacity
        );

        Self {
            resolver,
            cache,
            downloads,
            ttl: config.ttl,
            resolver_timeout: config.resolver_timeout,
            search_limit: config.search_limit,
            shutdown: CancellationToken::new(),
        }
    }

    /// Búsqueda sin caché.
    pub async fn search(&self, query: &str) -> Result<Vec<VideoSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolveError::invalid("query is empty"));
        }
        if query.len() > MAX_QUERY_LEN {
            return Err(ResolveError::invalid(format!(
                "query longer than {} characters",
                MAX_QUERY_LEN
            )));
        }

        self.bounded(self.resolver.search(query, self.search_limit)).await
    }

    /// Información de un vídeo, sin caché.
    pub async fn video(&self, id: &str) -> Result<VideoDetails> {
        crate::cache::validate_id(id)?;
        self.bounded(self.resolver.video(id)).await
    }

    pub async fn playlist(&self, id: &str) -> Result<Bytes> {
        self.cached(Namespace::Playlist, id).await
    }

    pub async fn audio(&self, id: &str) -> Result<Bytes> {
        self.cached(Namespace::Audio, id).await
    }

    pub async fn artist(&self, id: &str) -> Result<Bytes> {
        self.cached(Namespace::Artist, id).await
    }

    pub async fn download(&self, id: &str) -> Result<DownloadStream> {
        self.downloads.stream(id).await
    }

    /// Invalida la entrada cacheada de un recurso.
    pub fn invalidate(&self, namespace: Namespace, id: &str) -> Result<()> {
        let key = CacheKey::new(namespace, id)?;
        self.cache.invalidate(&key);
        Ok(())
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.cache.store().metrics()
    }

    /// Lanza la limpieza periódica de entradas expiradas.
    pub fn start(&self, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self.cache.store());
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("🛑 Tarea de mantenimiento detenida");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let removed = store.sweep_expired();
                let metrics = store.metrics();
                if removed > 0 {
                    info!("🧹 Cache cleanup: removed {} expired entries", removed);
                }
                debug!(
                    "📊 Caché: {} entradas, {}/{} bytes, hit rate {:.1}%",
                    store.len(),
                    store.used(),
                    store.capacity(),
                    metrics.hit_rate() * 100.0
                );
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn cached(&self, namespace: Namespace, id: &str) -> Result<Bytes> {
        let key = CacheKey::new(namespace, id)?;
        self.cache.handle(key, self.ttl.ttl_for(namespace)).await
    }

    async fn bounded<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.resolver_timeout, call)
            .await
            .unwrap_or(Err(ResolveError::Timeout(self.resolver_timeout)))
    }
}
