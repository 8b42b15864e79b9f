use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{AppError, Result};

/// One entry from the catalog's track or album search.
///
/// The summary is denormalized into download records so history stays
/// readable even if the catalog entry changes later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSummary {
    pub id: i64,
    pub title: String,
    pub artists: Vec<String>,
    pub duration: String,
    pub explicit: bool,
    pub cover: Option<String>,
    /// Delivery modes the catalog advertises for this entry (e.g. DOLBY_ATMOS, STEREO).
    pub modes: Option<Vec<String>>,
    pub formats: Option<Vec<String>>,
}

impl TrackSummary {
    pub fn artist_line(&self) -> String {
        self.artists.join(", ")
    }
}

/// Playback descriptor for a single track at a single quality.
///
/// URLs may be signed and short-lived, so a descriptor is resolved fresh for
/// every download and never reused across jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackInfo {
    pub id: i64,
    pub quality: String,
    pub codec: Option<String>,
    pub urls: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PlaybackInfo {
    /// Container extension for the downloaded (or merged) file.
    pub fn file_extension(&self) -> &'static str {
        match self.codec.as_deref().map(|c| c.to_ascii_lowercase()) {
            Some(codec) if codec.contains("flac") => "flac",
            Some(codec) if codec.contains("mp3") => "mp3",
            // AAC and the Atmos elementary streams (EAC-3 / AC-4) all end up
            // in an MP4 container.
            _ => "m4a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DownloadQuality {
    HiRes,
    Lossless,
    AtmosAc3,
    AtmosAc4,
    High,
    Low,
}

impl DownloadQuality {
    /// Value of the `quality` query parameter the catalog expects.
    pub fn as_param(&self) -> &'static str {
        match self {
            DownloadQuality::HiRes => "HI_RES_LOSSLESS",
            DownloadQuality::Lossless => "LOSSLESS",
            DownloadQuality::AtmosAc3 => "DOLBY_ATMOS_AC3",
            DownloadQuality::AtmosAc4 => "DOLBY_ATMOS_AC4",
            DownloadQuality::High => "HIGH",
            DownloadQuality::Low => "LOW",
        }
    }

    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "HI_RES_LOSSLESS" => Some(DownloadQuality::HiRes),
            "LOSSLESS" => Some(DownloadQuality::Lossless),
            "DOLBY_ATMOS_AC3" => Some(DownloadQuality::AtmosAc3),
            "DOLBY_ATMOS_AC4" => Some(DownloadQuality::AtmosAc4),
            "HIGH" => Some(DownloadQuality::High),
            "LOW" => Some(DownloadQuality::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_param())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    DolbyAtmos,
    Stereo,
}

impl DeliveryMode {
    pub fn as_param(&self) -> &'static str {
        match self {
            DeliveryMode::DolbyAtmos => "DOLBY_ATMOS",
            DeliveryMode::Stereo => "STEREO",
        }
    }

    /// Picks the single mode sent to the catalog: object-based surround when
    /// the track advertises it, stereo otherwise, nothing when the track
    /// carries no mode tags at all.
    pub fn select(modes: Option<&[String]>) -> Option<DeliveryMode> {
        let modes = modes?;
        if modes.iter().any(|m| m == "DOLBY_ATMOS") {
            Some(DeliveryMode::DolbyAtmos)
        } else if modes.iter().any(|m| m == "STEREO") {
            Some(DeliveryMode::Stereo)
        } else {
            None
        }
    }
}

/// Everything the download pipeline needs from the remote catalog.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn search_tracks(&self, query: &str) -> Result<Vec<TrackSummary>>;
    async fn search_albums(&self, query: &str) -> Result<Vec<TrackSummary>>;
    async fn album_tracks(&self, album_id: i64) -> Result<Vec<TrackSummary>>;
    async fn playback_info(
        &self,
        track_id: i64,
        quality: DownloadQuality,
        mode: Option<DeliveryMode>,
    ) -> Result<PlaybackInfo>;
    async fn track_metadata(&self, track_id: i64) -> Result<HashMap<String, String>>;
    async fn preview_info(&self, track_id: i64) -> Result<PlaybackInfo>;
    async fn cover_art(&self, url: &str) -> Result<Vec<u8>>;

    /// Resolves the playback descriptor and the tag set for one track.
    ///
    /// The two lookups are independent and run concurrently; if either one
    /// fails the whole resolve fails. A server-unreachable error is kept
    /// as-is so the user is pointed at their settings instead of a retry.
    async fn resolve_download_info(
        &self,
        track_id: i64,
        quality: DownloadQuality,
        modes: Option<&[String]>,
    ) -> Result<(PlaybackInfo, HashMap<String, String>)> {
        let mode = DeliveryMode::select(modes);
        tokio::try_join!(
            self.playback_info(track_id, quality, mode),
            self.track_metadata(track_id),
        )
        .map_err(|e| match e {
            AppError::ServerUnreachable(url) => AppError::ServerUnreachable(url),
            other => AppError::MetadataResolution(other.to_string()),
        })
    }
}

/// HTTP client for the catalog server.
pub struct CatalogClient {
    client: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(server_url: &str) -> Result<Self> {
        // Validate early so a bad setting fails at startup, not mid-download.
        Url::parse(server_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("cantata/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn classify(&self, error: reqwest::Error) -> AppError {
        if error.is_connect() || error.is_timeout() {
            AppError::ServerUnreachable(self.base_url.clone())
        } else {
            error.into()
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "{} returned HTTP {}",
                path,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn search_tracks(&self, query: &str) -> Result<Vec<TrackSummary>> {
        self.get_json(
            "/search/tracks",
            &[("query", query.to_string()), ("limit", "50".to_string())],
        )
        .await
    }

    async fn search_albums(&self, query: &str) -> Result<Vec<TrackSummary>> {
        self.get_json(
            "/search/albums",
            &[("query", query.to_string()), ("limit", "50".to_string())],
        )
        .await
    }

    async fn album_tracks(&self, album_id: i64) -> Result<Vec<TrackSummary>> {
        self.get_json("/album/tracks", &[("id", album_id.to_string())])
            .await
    }

    async fn playback_info(
        &self,
        track_id: i64,
        quality: DownloadQuality,
        mode: Option<DeliveryMode>,
    ) -> Result<PlaybackInfo> {
        let mut query = vec![
            ("id", track_id.to_string()),
            ("quality", quality.as_param().to_string()),
        ];
        if let Some(mode) = mode {
            query.push(("mode", mode.as_param().to_string()));
        }
        self.get_json("/track/playback", &query).await
    }

    async fn track_metadata(&self, track_id: i64) -> Result<HashMap<String, String>> {
        self.get_json("/track/metadata", &[("id", track_id.to_string())])
            .await
    }

    async fn preview_info(&self, track_id: i64) -> Result<PlaybackInfo> {
        self.get_json("/track/preview", &[("id", track_id.to_string())])
            .await
    }

    async fn cover_art(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "cover art fetch returned HTTP {}",
                response.status()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
