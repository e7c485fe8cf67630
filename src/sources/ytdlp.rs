use async_process::Command;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{ArtistCatalog, AudioStream, MediaResolver, Playlist, VideoDetails, VideoSummary};
use crate::error::{ResolveError, Result};

const WATCH_URL: &str = "https://www.youtube.com/watch";
const PLAYLIST_URL: &str = "https://www.youtube.com/playlist";
const CHANNEL_URL: &str = "https://www.youtube.com/channel";

/// Cliente que resuelve metadata ejecutando yt-dlp.
///
/// Every call spawns one `yt-dlp --dump-single-json` process; the process is
/// killed if the caller stops waiting for it (timeout or disconnect).
pub struct YtDlpResolver {
    binary: String,
    max_playlist_items: usize,
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    description: Option<String>,
    upload_date: Option<String>,
    is_live: Option<bool>,

    // Campos del formato seleccionado (-f bestaudio)
    url: Option<String>,
    ext: Option<String>,
    abr: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// Playlist o pestaña de canal en modo `--flat-playlist`
#[derive(Debug, Deserialize)]
struct YtDlpListing {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    entries: Vec<YtDlpInfo>,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, max_playlist_items: usize) -> Self {
        Self {
            binary: binary.into(),
            max_playlist_items,
        }
    }

    /// Verifica que yt-dlp esté disponible y devuelve su versión.
    pub async fn version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("yt-dlp no puede ejecutarse correctamente");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        debug!("🔧 {} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolveError::upstream(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("❌ yt-dlp falló: {}", stderr.trim());
            return Err(classify_failure(&stderr));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ResolveError::upstream(format!("unexpected yt-dlp output: {}", e)))
    }

    async fn listing(&self, url: &str) -> Result<YtDlpListing> {
        let limit = self.max_playlist_items.to_string();
        self.run_json(&[
            "--flat-playlist",
            "--dump-single-json",
            "--playlist-end",
            &limit,
            "--no-warnings",
            url,
        ])
        .await
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VideoSummary>> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch{}:{}", limit, query);
        let listing: YtDlpListing = self
            .run_json(&[
                "--flat-playlist",
                "--dump-single-json",
                "--no-warnings",
                &search_query,
            ])
            .await?;

        Ok(listing.entries.into_iter().map(into_summary).collect())
    }

    async fn video(&self, id: &str) -> Result<VideoDetails> {
        debug!("📊 Obteniendo info de: {}", id);

        let url = watch_url(id)?;
        let info: YtDlpInfo = self
            .run_json(&["--no-playlist", "--dump-single-json", "--no-warnings", url.as_str()])
            .await?;

        let description = info.description.clone();
        let upload_date = info.upload_date.clone();
        let is_live = info.is_live.unwrap_or(false);
        Ok(VideoDetails {
            summary: into_summary(info),
            description,
            upload_date,
            is_live,
        })
    }

    async fn playlist(&self, id: &str) -> Result<Playlist> {
        info!("📋 Obteniendo playlist: {}", id);

        let url = Url::parse_with_params(PLAYLIST_URL, &[("list", id)])
            .map_err(|e| ResolveError::invalid(e.to_string()))?;
        let listing = self.listing(url.as_str()).await?;

        Ok(Playlist {
            title: listing.title.unwrap_or_else(|| listing.id.clone()),
            id: listing.id,
            author: listing.uploader.or(listing.channel),
            items: listing.entries.into_iter().map(into_summary).collect(),
        })
    }

    async fn audio(&self, id: &str) -> Result<AudioStream> {
        debug!("🎵 Obteniendo URL de stream para: {}", id);

        let url = watch_url(id)?;
        let info: YtDlpInfo = self
            .run_json(&[
                "--no-playlist",
                "-f",
                "bestaudio/best",
                "--dump-single-json",
                "--no-warnings",
                url.as_str(),
            ])
            .await?;

        into_audio(info)
    }

    async fn artist(&self, id: &str) -> Result<ArtistCatalog> {
        info!("🎤 Obteniendo catálogo del artista: {}", id);

        let url = format!("{}/{}/videos", CHANNEL_URL, id);
        let listing = self.listing(&url).await?;

        Ok(ArtistCatalog {
            id: id.to_string(),
            name: listing
                .channel
                .or(listing.uploader)
                .or(listing.title)
                .unwrap_or_else(|| id.to_string()),
            items: listing.entries.into_iter().map(into_summary).collect(),
        })
    }

    fn source_name(&self) -> &'static str {
        "YouTube"
    }
}

fn watch_url(id: &str) -> Result<Url> {
    Url::parse_with_params(WATCH_URL, &[("v", id)]).map_err(|e| ResolveError::invalid(e.to_string()))
}

/// Convierte YtDlpInfo a VideoSummary
fn into_summary(info: YtDlpInfo) -> VideoSummary {
    let thumb = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().last().map(|t| t.url));

    VideoSummary {
        title: info.title.unwrap_or_else(|| info.id.clone()),
        id: info.id,
        author: info.uploader.or(info.channel),
        views: info.view_count,
        length: info.duration.map(|d| d.round() as u64),
        thumb,
    }
}

/// Descriptor de audio a partir del formato elegido por `-f bestaudio`.
///
/// Only `filesize` is exact; `filesize_approx` is an estimate and must never
/// be advertised as a content length.
fn into_audio(info: YtDlpInfo) -> Result<AudioStream> {
    let stream_url = info
        .url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ResolveError::upstream("No se pudo obtener URL de stream"))?;

    Ok(AudioStream {
        title: info.title.unwrap_or_else(|| info.id.clone()),
        id: info.id,
        url: stream_url,
        ext: info.ext,
        bitrate: info.abr,
        content_length: info.filesize,
        approx_size: info.filesize_approx,
        length: info.duration.map(|d| d.round() as u64),
    })
}

/// Clasifica el stderr de yt-dlp en la taxonomía de errores.
fn classify_failure(stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .unwrap_or_else(|| stderr.trim())
        .trim()
        .to_string();

    let not_found = lower.contains("video unavailable")
        || lower.contains("is unavailable")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("private video")
        || lower.contains("playlist is private")
        || lower.contains("http error 404");

    if not_found {
        ResolveError::NotFound(message)
    } else {
        ResolveError::UpstreamUnavailable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAYLIST_JSON: &str = r#"{
        "id": "PLx",
        "title": "Road trip",
        "uploader": "someone",
        "_type": "playlist",
        "entries": [
            {"id": "v1", "title": "First", "channel": "Band", "duration": 201.4, "view_count": 12,
             "thumbnails": [{"url": "https://i.ytimg.com/small.jpg"}, {"url": "https://i.ytimg.com/big.jpg"}]},
            {"id": "v2", "title": null, "duration": null}
        ]
    }"#;

    #[test]
    fn test_flat_playlist_entries_become_summaries() {
        let listing: YtDlpListing = serde_json::from_str(PLAYLIST_JSON).unwrap();
        let items: Vec<VideoSummary> = listing.entries.into_iter().map(into_summary).collect();

        assert_eq!(
            items[0],
            VideoSummary {
                id: "v1".to_string(),
                title: "First".to_string(),
                author: Some("Band".to_string()),
                views: Some(12),
                length: Some(201),
                thumb: Some("https://i.ytimg.com/big.jpg".to_string()),
            }
        );
        assert_eq!(items[1].title, "v2");
        assert_eq!(items[1].length, None);
    }

    #[test]
    fn test_approximate_size_is_not_a_content_length() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{"id": "a1", "title": "Song", "url": "https://cdn.example.com/a1.webm",
                "ext": "webm", "abr": 129.5, "filesize": null, "filesize_approx": 5000000,
                "duration": 179.6}"#,
        )
        .unwrap();
        let audio = into_audio(info).unwrap();

        assert_eq!(audio.content_length, None);
        assert_eq!(audio.approx_size, Some(5_000_000));
        assert_eq!(audio.length, Some(180));

        let info: YtDlpInfo =
            serde_json::from_str(r#"{"id": "a2", "url": "https://cdn.example.com/a2.m4a", "filesize": 4900000}"#)
                .unwrap();
        assert_eq!(into_audio(info).unwrap().content_length, Some(4_900_000));
    }

    #[test]
    fn test_audio_without_url_is_upstream_error() {
        let info: YtDlpInfo = serde_json::from_str(r#"{"id": "a3", "url": ""}"#).unwrap();
        assert!(matches!(into_audio(info), Err(ResolveError::UpstreamUnavailable(_))));
    }

    #[test]
    fn test_classify_failure() {
        let missing = "WARNING: something\nERROR: [youtube] abc: Video unavailable\n";
        assert_eq!(
            classify_failure(missing),
            ResolveError::NotFound("ERROR: [youtube] abc: Video unavailable".to_string())
        );

        assert!(matches!(
            classify_failure("ERROR: [youtube:tab] PLx: The playlist does not exist."),
            ResolveError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: Unable to download webpage: <urlopen error timed out>"),
            ResolveError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn test_watch_url_escapes_identifier() {
        assert_eq!(
            watch_url("dQw4w9WgXcQ").unwrap().as_str(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_upstream_unavailable() {
        let resolver = YtDlpResolver::new("/nonexistent/yt-dlp", 10);
        let err = resolver.video("dQw4w9WgXcQ").await.unwrap_err();
        assert!(matches!(err, ResolveError::UpstreamUnavailable(_)));
    }
}
