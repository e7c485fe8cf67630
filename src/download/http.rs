use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

use super::{ByteSource, UpstreamBody};
use crate::error::{ResolveError, Result};
use crate::sources::MediaResolver;

/// Fuente HTTP: resuelve la URL de audio y la descarga con reqwest.
///
/// The stream URL is resolved on every download; downloads never touch the
/// metadata cache.
pub struct HttpByteSource<R: ?Sized> {
    resolver: Arc<R>,
    client: reqwest::Client,
}

impl<R> HttpByteSource<R>
where
    R: MediaResolver + ?Sized,
{
    pub fn new(resolver: Arc<R>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        Ok(Self { resolver, client })
    }
}

#[async_trait]
impl<R> ByteSource for HttpByteSource<R>
where
    R: MediaResolver + ?Sized,
{
    async fn open(&self, id: &str) -> Result<UpstreamBody> {
        let audio = self.resolver.audio(id).await?;

        let url = Url::parse(&audio.url)
            .map_err(|_| ResolveError::upstream(format!("URL mal formada para {}", id)))?;
        debug!("🔗 Abriendo stream de {} en {}", id, url.host_str().unwrap_or("?"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::upstream(e.to_string()))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(ResolveError::NotFound(format!("{} ({})", id, status)));
        }
        if !status.is_success() {
            return Err(ResolveError::upstream(format!("HTTP error: {}", status)));
        }

        Ok(UpstreamBody {
            content_length: response.content_length().or(audio.content_length),
            chunks: response
                .bytes_stream()
                .map_err(|e| ResolveError::upstream(e.to_string()))
                .boxed(),
        })
    }
}
