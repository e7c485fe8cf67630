pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, Namespace};
use crate::error::Result;

pub use ytdlp::YtDlpResolver;

/// Trait común para los proveedores de metadata.
///
/// Implementations query an external media source and do no caching or
/// call collapsing of their own. They must be safe to call concurrently for
/// different identifiers; the cache never issues two concurrent calls for the
/// same cacheable key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Busca vídeos en la fuente
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VideoSummary>>;

    /// Obtiene información detallada de un vídeo
    async fn video(&self, id: &str) -> Result<VideoDetails>;

    /// Obtiene el listado de una playlist
    async fn playlist(&self, id: &str) -> Result<Playlist>;

    /// Obtiene el descriptor del stream de audio
    async fn audio(&self, id: &str) -> Result<AudioStream>;

    /// Obtiene el catálogo de un artista (canal)
    async fn artist(&self, id: &str) -> Result<ArtistCatalog>;

    /// Nombre de la fuente
    fn source_name(&self) -> &'static str;
}

/// Resuelve una clave de caché con el método que corresponde a su namespace.
pub async fn resolve<R>(resolver: &R, key: &CacheKey) -> Result<Resolved>
where
    R: MediaResolver + ?Sized,
{
    match key.namespace() {
        Namespace::Playlist => resolver.playlist(key.id()).await.map(Resolved::Playlist),
        Namespace::Audio => resolver.audio(key.id()).await.map(Resolved::Audio),
        Namespace::Artist => resolver.artist(key.id()).await.map(Resolved::Artist),
    }
}

/// Resultado de resolver una clave cacheable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resolved {
    Playlist(Playlist),
    Audio(AudioStream),
    Artist(ArtistCatalog),
}

/// Un vídeo tal como lo listan búsquedas, playlists y catálogos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub views: Option<u64>,
    /// Duración en segundos
    pub length: Option<u64>,
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDetails {
    #[serde(flatten)]
    pub summary: VideoSummary,
    pub description: Option<String>,
    pub upload_date: Option<String>,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub items: Vec<VideoSummary>,
}

/// Descriptor de un stream de audio reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    pub id: String,
    pub title: String,
    /// URL directa del stream
    pub url: String,
    pub ext: Option<String>,
    /// kbps
    pub bitrate: Option<f64>,
    /// Tamaño exacto en bytes, si la fuente lo conoce
    pub content_length: Option<u64>,
    /// Estimación del tamaño; solo informativa
    pub approx_size: Option<u64>,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCatalog {
    pub id: String,
    pub name: String,
    pub items: Vec<VideoSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn catalog() -> ArtistCatalog {
        ArtistCatalog {
            id: "a1".to_string(),
            name: "Artist".to_string(),
            items: vec![],
        }
    }

    #[tokio::test]
    async fn test_resolve_dispatches_on_namespace() {
        let mut resolver = MockMediaResolver::new();
        resolver
            .expect_artist()
            .with(eq("a1"))
            .times(1)
            .returning(|_| Ok(catalog()));
        resolver.expect_playlist().never();
        resolver.expect_audio().never();

        let key = CacheKey::new(Namespace::Artist, "a1").unwrap();
        let resolved = resolve(&resolver, &key).await.unwrap();
        assert_eq!(resolved, Resolved::Artist(catalog()));
    }

    #[tokio::test]
    async fn test_resolve_propagates_errors() {
        let mut resolver = MockMediaResolver::new();
        resolver
            .expect_playlist()
            .returning(|id| Err(ResolveError::NotFound(id.to_string())));

        let key = CacheKey::new(Namespace::Playlist, "gone").unwrap();
        let err = resolve(&resolver, &key).await.unwrap_err();
        assert_eq!(err, ResolveError::NotFound("gone".to_string()));
    }

    #[test]
    fn test_resolved_serializes_without_tag() {
        let body = serde_json::to_value(Resolved::Artist(catalog())).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "id": "a1", "name": "Artist", "items": [] })
        );
    }

    #[test]
    fn test_video_details_flatten_summary() {
        let details = VideoDetails {
            summary: VideoSummary {
                id: "v1".to_string(),
                title: "Song".to_string(),
                author: Some("Band".to_string()),
                views: Some(10),
                length: Some(200),
                thumb: None,
            },
            description: None,
            upload_date: Some("20240101".to_string()),
            is_live: false,
        };
        let body = serde_json::to_value(&details).unwrap();
        assert_eq!(body["title"], "Song");
        assert_eq!(body["length"], 200);
        assert_eq!(body["upload_date"], "20240101");
    }
}
