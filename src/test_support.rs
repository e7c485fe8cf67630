//! Resolver de prueba que cuenta invocaciones por identificador.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};

use crate::error::{ResolveError, Result};
use crate::sources::{
    ArtistCatalog, AudioStream, MediaResolver, Playlist, VideoDetails, VideoSummary,
};

#[derive(Default)]
pub struct CountingResolver {
    delay: Duration,
    failure: Option<ResolveError>,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingResolver {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing_with(mut self, error: ResolveError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }

    async fn record(&self, id: &str) -> Result<()> {
        *self.calls.lock().entry(id.to_string()).or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

pub fn summary(id: &str) -> VideoSummary {
    VideoSummary {
        id: id.to_string(),
        title: format!("video {}", id),
        author: Some("Someone".to_string()),
        views: Some(1),
        length: Some(180),
        thumb: None,
    }
}

#[async_trait]
impl MediaResolver for CountingResolver {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VideoSummary>> {
        self.record(query).await?;
        Ok((0..limit.min(3)).map(|i| summary(&format!("s{}", i))).collect())
    }

    async fn video(&self, id: &str) -> Result<VideoDetails> {
        self.record(id).await?;
        Ok(VideoDetails {
            summary: summary(id),
            description: None,
            upload_date: None,
            is_live: false,
        })
    }

    async fn playlist(&self, id: &str) -> Result<Playlist> {
        self.record(id).await?;
        Ok(Playlist {
            id: id.to_string(),
            title: format!("playlist {}", id),
            author: None,
            items: vec![summary("v1"), summary("v2")],
        })
    }

    async fn audio(&self, id: &str) -> Result<AudioStream> {
        self.record(id).await?;
        Ok(AudioStream {
            id: id.to_string(),
            title: format!("audio {}", id),
            url: format!("https://cdn.example.com/{}.webm", id),
            ext: Some("webm".to_string()),
            bitrate: Some(128.0),
            content_length: Some(1024),
            approx_size: None,
            length: Some(180),
        })
    }

    async fn artist(&self, id: &str) -> Result<ArtistCatalog> {
        self.record(id).await?;
        Ok(ArtistCatalog {
            id: id.to_string(),
            name: format!("artist {}", id),
            items: vec![summary("v9")],
        })
    }

    fn source_name(&self) -> &'static str {
        "counting"
    }
}
