use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;

use crate::errors::{AppError, Result};

/// Progress callback, fed coalesced integer percentages of one stream.
pub type ProgressSink = Box<dyn Fn(u8) + Send + Sync>;

/// Downloads one named stream URL to a scratch file.
#[async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Streams `url` into `dest`, reporting progress and honoring the
    /// cancellation flag between chunks. Returns the number of bytes written.
    /// On cancellation the partial file is removed and `Canceled` is returned.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &AtomicBool,
        progress: ProgressSink,
    ) -> Result<u64>;
}

pub struct HttpStreamFetcher {
    client: Client,
}

impl HttpStreamFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("cantata/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self { client })
    }

    fn fetch_error(url: &str, cause: impl std::fmt::Display) -> AppError {
        AppError::Fetch {
            url: url.to_string(),
            cause: cause.to_string(),
        }
    }
}

#[async_trait]
impl StreamFetcher for HttpStreamFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &AtomicBool,
        progress: ProgressSink,
    ) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::fetch_error(url, e))?;

        if !response.status().is_success() {
            return Err(Self::fetch_error(
                url,
                format!("HTTP {}", response.status()),
            ));
        }

        let total_size = response.content_length().unwrap_or(0);
        let mut downloaded = 0u64;
        let mut last_percent: Option<u8> = None;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Self::fetch_error(url, e))?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::Relaxed) {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(AppError::Canceled);
            }

            let chunk = chunk.map_err(|e| Self::fetch_error(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Self::fetch_error(url, e))?;
            downloaded += chunk.len() as u64;

            // Coalesce to whole-percent steps so observers aren't flooded
            // with one update per network chunk.
            if total_size > 0 {
                let percent = ((downloaded * 100) / total_size).min(100) as u8;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    progress(percent);
                }
            }
        }

        file.flush().await.map_err(|e| Self::fetch_error(url, e))?;
        if last_percent != Some(100) {
            progress(100);
        }

        log::debug!("Fetched {} bytes from {} to {:?}", downloaded, url, dest);
        Ok(downloaded)
    }
}
