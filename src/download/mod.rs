//! # Download Module
//!
//! Uncached `/download` path: relays bytes from an upstream source to the
//! client as they arrive.
//!
//! ## Features
//!
//! - **Streaming**: a lazy, finite, non-restartable sequence of chunks; memory
//!   stays bounded by `chunk_size * buffer_chunks` whatever the content size
//! - **Backpressure**: the relay task waits on a bounded channel when the
//!   client reads slowly
//! - **Early failure**: a source that fails before the first byte fails the
//!   whole request; later failures truncate the stream (no retry)
//! - **Prompt release**: dropping the stream cancels the relay and closes
//!   the upstream connection
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle -> Connecting -> Streaming -> { Completed | Aborted }
//! ```

pub mod http;

pub use http::HttpByteSource;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::validate_id;
use crate::error::{ResolveError, Result};

/// Cuerpo abierto en la fuente upstream.
pub struct UpstreamBody {
    /// Tamaño total, si la fuente lo informa
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

/// Fuente de bytes para descargas.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn open(&self, id: &str) -> Result<UpstreamBody>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Aborted,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Aborted)
    }
}

/// Download Streamer.
pub struct DownloadStreamer<S: ?Sized> {
    source: Arc<S>,
    chunk_size: usize,
    buffer_chunks: usize,
    connect_timeout: Duration,
}

impl<S> DownloadStreamer<S>
where
    S: ByteSource + ?Sized,
{
    pub fn new(
        source: Arc<S>,
        chunk_size: usize,
        buffer_chunks: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            buffer_chunks: buffer_chunks.max(1),
            connect_timeout,
        }
    }

    /// Abre la fuente de `id` y devuelve el stream de bytes.
    ///
    /// Fails only if nothing could be sent: invalid id, unknown id, or an
    /// upstream that fails before producing its first chunk.
    ///
    /// `connect_timeout` bounds opening the source and receiving its first
    /// chunk together. The returned session is already `Streaming`; `Idle`
    /// and `Connecting` are only passed through inside this call.
    pub async fn stream(&self, id: &str) -> Result<DownloadStream> {
        validate_id(id)?;

        let mut state = DownloadState::Idle;
        advance(id, &mut state, DownloadState::Connecting);

        // Abrir y esperar el primer chunk cuentan como una sola conexión
        let (body, first) = match tokio::time::timeout(self.connect_timeout, self.connect(id)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                advance(id, &mut state, DownloadState::Aborted);
                return Err(connect_error(e));
            }
            Err(_) => {
                advance(id, &mut state, DownloadState::Aborted);
                return Err(ResolveError::upstream(format!(
                    "timed out after {:?} connecting to upstream for {}",
                    self.connect_timeout, id
                )));
            }
        };

        let UpstreamBody {
            content_length,
            chunks,
        } = body;
        advance(id, &mut state, DownloadState::Streaming);

        info!(
            "⬇️ Descarga {} iniciada ({})",
            id,
            content_length.map_or("tamaño desconocido".to_string(), |len| format!("{} bytes", len))
        );

        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        let cancel = CancellationToken::new();
        tokio::spawn(relay(
            first,
            chunks,
            tx,
            cancel.clone(),
            self.chunk_size,
        ));

        Ok(DownloadStream {
            id: id.to_string(),
            content_length,
            bytes_transferred: 0,
            state,
            rx,
            cancel,
        })
    }

    async fn connect(&self, id: &str) -> Result<(UpstreamBody, Option<Bytes>)> {
        debug!("🔌 Conectando descarga {}", id);
        let mut body = self.source.open(id).await?;
        let first = body.chunks.next().await.transpose()?;
        Ok((body, first))
    }
}

fn advance(id: &str, state: &mut DownloadState, next: DownloadState) {
    debug!("🔀 Descarga {}: {:?} -> {:?}", id, state, next);
    *state = next;
}

fn connect_error(error: ResolveError) -> ResolveError {
    match error {
        ResolveError::NotFound(_) | ResolveError::Invalid(_) => error,
        other => ResolveError::upstream(other.to_string()),
    }
}

/// Copia chunks de la fuente al canal hasta fin, error o cancelación.
async fn relay(
    first: Option<Bytes>,
    mut chunks: BoxStream<'static, Result<Bytes>>,
    tx: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
    chunk_size: usize,
) {
    if let Some(first) = first {
        if !send_split(&tx, first, chunk_size).await {
            return;
        }
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("🛑 Relay cancelado, liberando upstream");
                return;
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                if !send_split(&tx, bytes, chunk_size).await {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            None => return,
        }
    }
}

/// Envía `bytes` en trozos de como mucho `chunk_size`. `false` si el cliente se fue.
async fn send_split(tx: &mpsc::Sender<Result<Bytes>>, mut bytes: Bytes, chunk_size: usize) -> bool {
    while !bytes.is_empty() {
        let piece = bytes.split_to(chunk_size.min(bytes.len()));
        if tx.send(Ok(piece)).await.is_err() {
            return false;
        }
    }
    true
}

/// Sesión de descarga: stream de chunks para un único cliente.
///
/// Yields `Ok` chunks until the upstream ends (`Completed`) or fails
/// (`Aborted`, after yielding the error once). Dropping it mid-stream
/// releases the upstream handle.
pub struct DownloadStream {
    id: String,
    content_length: Option<u64>,
    bytes_transferred: u64,
    state: DownloadState,
    rx: mpsc::Receiver<Result<Bytes>>,
    cancel: CancellationToken,
}

impl DownloadStream {
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    fn abort(&mut self, error: &ResolveError) {
        self.state = DownloadState::Aborted;
        self.cancel.cancel();
        warn!(
            "⚠️ Descarga {} abortada tras {} bytes: {}",
            self.id, self.bytes_transferred, error
        );
    }
}

impl Stream for DownloadStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state.is_terminal() {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.abort(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => match self.content_length {
                Some(expected) if self.bytes_transferred < expected => {
                    let e = ResolveError::upstream(format!(
                        "upstream closed after {} of {} bytes",
                        self.bytes_transferred, expected
                    ));
                    self.abort(&e);
                    Poll::Ready(Some(Err(e)))
                }
                _ => {
                    self.state = DownloadState::Completed;
                    info!("✅ Descarga {} completada ({} bytes)", self.id, self.bytes_transferred);
                    Poll::Ready(None)
                }
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.state.is_terminal() {
            debug!(
                "🔌 Cliente desconectado de {} tras {} bytes",
                self.id, self.bytes_transferred
            );
        }
    }
}
