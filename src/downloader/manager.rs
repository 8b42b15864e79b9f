use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::api::CatalogApi;
use crate::config::AppConfig;
use crate::downloader::fetcher::{ProgressSink, StreamFetcher};
use crate::downloader::merger::StreamMerger;
use crate::downloader::{DownloadJob, DownloadRequest, DownloadStatus};
use crate::errors::{AppError, Result};
use crate::metadata::{self, TagOptions, Tagger};
use crate::notification::NotificationPresenter;
use crate::store::JobStore;
use crate::utils::{ensure_dir_exists, job_id_for};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub tag_options: TagOptions,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            download_dir: config.download_path.clone(),
            max_concurrent: config.max_concurrent_downloads.max(1),
            retry_attempts: config.retry_attempts.max(1),
            tag_options: TagOptions {
                embed_cover_art: config.embed_cover_art,
                embed_lyrics: config.embed_lyrics,
                file_naming_format: config.file_naming_format,
                include_track_number: config.include_track_number,
            },
        }
    }
}

/// Schedules download jobs across a fixed pool of workers.
///
/// Jobs drain from a FIFO queue; each worker owns one job end-to-end
/// (resolve, fetch, merge, tag, finalize). The job map is the single point
/// of mutation and every transition is pushed to the store, the notifier
/// and the snapshot stream.
pub struct DownloadManager {
    worker: Worker,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl DownloadManager {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        fetcher: Arc<dyn StreamFetcher>,
        merger: Arc<dyn StreamMerger>,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn NotificationPresenter>,
        settings: ManagerSettings,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let (events, _) = broadcast::channel(1024);

        let worker = Worker {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            events,
            catalog,
            fetcher,
            merger,
            store,
            notifier,
            settings: Arc::new(settings),
        };

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for slot in 0..worker.settings.max_concurrent {
            let worker = worker.clone();
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                loop {
                    let next = { queue_rx.lock().await.recv().await };
                    match next {
                        Some(job_id) => worker.run(&job_id).await,
                        None => break,
                    }
                }
                log::debug!("Download worker {} stopped", slot);
            });
        }

        Self { worker, queue_tx }
    }

    /// Accepts a download request; albums fan out into one job per track.
    ///
    /// Idempotent per derived job id: resubmitting a track/quality pair that
    /// is still in flight returns the existing job id instead of duplicating
    /// work. A terminal record is replaced by a fresh job under the same id.
    pub async fn submit(&self, request: DownloadRequest) -> Result<Vec<String>> {
        match request {
            DownloadRequest::Track { track, quality } => {
                Ok(vec![self.submit_track(track, quality).await?])
            }
            DownloadRequest::Album { album_id, quality } => {
                let tracks = self.worker.catalog.album_tracks(album_id).await?;
                log::info!("Album {} fans out into {} track downloads", album_id, tracks.len());
                let mut job_ids = Vec::with_capacity(tracks.len());
                for track in tracks {
                    job_ids.push(self.submit_track(track, quality).await?);
                }
                Ok(job_ids)
            }
        }
    }

    async fn submit_track(
        &self,
        track: crate::api::TrackSummary,
        quality: crate::api::DownloadQuality,
    ) -> Result<String> {
        let job_id = job_id_for(track.id, quality);

        let job = {
            let mut jobs = self.worker.jobs.lock().await;
            if let Some(existing) = jobs.get(&job_id) {
                if !existing.status.is_terminal() {
                    log::debug!("Download {} already in flight, reusing job", job_id);
                    return Ok(job_id);
                }
            }
            let job = DownloadJob::new(job_id.clone(), track, quality);
            jobs.insert(job_id.clone(), job.clone());
            job
        };

        self.worker
            .cancel_flags
            .lock()
            .await
            .insert(job_id.clone(), Arc::new(AtomicBool::new(false)));

        self.worker.store.upsert(&job).await?;
        self.worker.notifier.on_created(&job_id, &job.track.title);
        let _ = self.worker.events.send(job);

        self.queue_tx
            .send(job_id.clone())
            .map_err(|_| AppError::Download("download queue is closed".to_string()))?;

        Ok(job_id)
    }

    /// Cancels a job. Queued jobs are removed immediately; an active job is
    /// flagged and its worker cleans up at the next chunk or stage boundary.
    /// Cancellation leaves no failure record behind.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let flag = self.worker.cancel_flags.lock().await.get(job_id).cloned();
        let Some(flag) = flag else {
            return Err(AppError::NotFound(format!("active download {}", job_id)));
        };
        flag.store(true, Ordering::SeqCst);

        let was_queued = {
            let mut jobs = self.worker.jobs.lock().await;
            match jobs.get(job_id).map(|j| j.status) {
                Some(DownloadStatus::Queued) => {
                    jobs.remove(job_id);
                    true
                }
                _ => false,
            }
        };

        if was_queued {
            self.worker.cancel_flags.lock().await.remove(job_id);
            self.worker.store.delete(job_id).await?;
            self.worker.notifier.on_canceled(job_id);
        }

        Ok(())
    }

    /// Accepts the external "file removed by the user" event.
    pub async fn mark_deleted(&self, job_id: &str) -> Result<()> {
        let snapshot = {
            let mut jobs = self.worker.jobs.lock().await;
            match jobs.get_mut(job_id) {
                Some(job) if job.status == DownloadStatus::Completed => {
                    job.status = DownloadStatus::Deleted;
                    job.file_path = None;
                    Some(job.clone())
                }
                Some(_) => {
                    return Err(AppError::InvalidInput(format!(
                        "download {} is not completed",
                        job_id
                    )))
                }
                None => None,
            }
        };

        match snapshot {
            Some(job) => {
                self.worker.store.upsert(&job).await?;
                let _ = self.worker.events.send(job);
                Ok(())
            }
            // Only known from an earlier run: update the stored record.
            None => crate::store::mark_record_deleted(self.worker.store.as_ref(), job_id).await,
        }
    }

    /// Live snapshot stream: one `DownloadJob` per transition and per
    /// progress tick, ordered per job.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadJob> {
        self.worker.events.subscribe()
    }

    pub async fn job(&self, job_id: &str) -> Option<DownloadJob> {
        self.worker.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn jobs(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> =
            self.worker.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Marks records left non-terminal by a dead process as failed so they
    /// are not reported as active forever.
    pub async fn recover_stale(&self) -> Result<usize> {
        let mut repaired = 0;
        for mut job in self.worker.store.list_all().await? {
            if !job.status.is_terminal() {
                job.status = DownloadStatus::Failed;
                job.error = Some("interrupted by shutdown".to_string());
                self.worker.store.upsert(&job).await?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            log::warn!("Marked {} interrupted download(s) as failed", repaired);
        }
        Ok(repaired)
    }
}

#[derive(Clone)]
struct Worker {
    jobs: Arc<Mutex<HashMap<String, DownloadJob>>>,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    events: broadcast::Sender<DownloadJob>,
    catalog: Arc<dyn CatalogApi>,
    fetcher: Arc<dyn StreamFetcher>,
    merger: Arc<dyn StreamMerger>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn NotificationPresenter>,
    settings: Arc<ManagerSettings>,
}

impl Worker {
    async fn run(&self, job_id: &str) {
        let job = {
            let jobs = self.jobs.lock().await;
            match jobs.get(job_id) {
                Some(job) => job.clone(),
                // Canceled while still queued.
                None => return,
            }
        };

        log::info!(
            "🚀 Starting download: {} - {} ({})",
            job.track.artist_line(),
            job.track.title,
            job.quality
        );

        match self.process(&job).await {
            Ok(final_path) => self.finish_completed(job_id, final_path).await,
            Err(AppError::Canceled) => self.finish_canceled(job_id).await,
            Err(error) => self.finish_failed(job_id, error).await,
        }
    }

    async fn process(&self, job: &DownloadJob) -> Result<PathBuf> {
        let cancel = self
            .cancel_flags
            .lock()
            .await
            .get(&job.id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        self.transition(&job.id, DownloadStatus::Downloading).await;
        self.notifier.on_progress(&job.id, &job.track.title, 0, true);

        let (playback, tags) = self
            .with_retry("resolve", &cancel, || {
                self.catalog.resolve_download_info(
                    job.track.id,
                    job.quality,
                    job.track.modes.as_deref(),
                )
            })
            .await?;

        if playback.urls.is_empty() {
            return Err(AppError::MetadataResolution(
                "playback descriptor carries no stream URLs".to_string(),
            ));
        }

        ensure_dir_exists(&self.settings.download_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(".cantata-")
            .tempdir_in(&self.settings.download_dir)?;

        let extension = playback.file_extension();
        let stream_count = playback.urls.len();

        // Progress ticks funnel through one channel so observers see them in
        // order; the drain task is joined before the next status transition.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
        let drainer = {
            let worker = self.clone();
            let job_id = job.id.clone();
            let title = job.track.title.clone();
            tokio::spawn(async move {
                while let Some(percent) = progress_rx.recv().await {
                    worker.set_progress(&job_id, &title, percent).await;
                }
            })
        };

        let mut parts = Vec::with_capacity(stream_count);
        for (index, url) in playback.urls.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Err(AppError::Canceled);
            }

            let dest = scratch.path().join(format!("stream-{}.{}", index, extension));
            // Each stream owns an equal slice of the 0-100 range so overall
            // progress never moves backwards between streams.
            let base = (index * 100 / stream_count) as u8;
            let span = (100 / stream_count) as u8;

            self.with_retry("stream fetch", &cancel, || {
                let tx = progress_tx.clone();
                let sink: ProgressSink = Box::new(move |percent| {
                    let scaled = base + ((percent as usize * span as usize) / 100) as u8;
                    let _ = tx.send(scaled);
                });
                self.fetcher.fetch(url, &dest, &cancel, sink)
            })
            .await?;

            parts.push(dest);
        }

        drop(progress_tx);
        let _ = drainer.await;

        let output = if parts.len() > 1 {
            if cancel.load(Ordering::SeqCst) {
                return Err(AppError::Canceled);
            }

            self.transition(&job.id, DownloadStatus::Merging).await;
            self.notifier.on_progress(&job.id, &job.track.title, 100, true);

            let merge_target = scratch.path().join(format!("merged.{}", extension));
            let merged = self
                .with_retry("merge", &cancel, || self.merger.merge(&parts, &merge_target))
                .await?;

            // A merge in flight is never aborted; a cancellation that arrived
            // meanwhile discards the finished result instead.
            if cancel.load(Ordering::SeqCst) {
                return Err(AppError::Canceled);
            }
            merged
        } else {
            parts.remove(0)
        };

        if cancel.load(Ordering::SeqCst) {
            return Err(AppError::Canceled);
        }

        self.apply_tags(&output, job, &tags).await;

        let file_name =
            metadata::file_name_for(&job.track, &tags, &self.settings.tag_options, extension);
        let final_path = self.settings.download_dir.join(file_name);
        tokio::fs::rename(&output, &final_path).await?;

        Ok(final_path)
    }

    async fn apply_tags(
        &self,
        path: &Path,
        job: &DownloadJob,
        tags: &HashMap<String, String>,
    ) {
        let cover = if self.settings.tag_options.embed_cover_art {
            match &job.track.cover {
                Some(url) => match self.catalog.cover_art(url).await {
                    Ok(bytes) if !bytes.is_empty() => Some(bytes),
                    Ok(_) => None,
                    Err(e) => {
                        log::warn!("⚠️ Cover art fetch failed for {}: {}", job.track.title, e);
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        // A bad tag write must not throw away a good download.
        if let Err(e) = Tagger::apply(path, tags, cover.as_deref(), &self.settings.tag_options) {
            log::warn!(
                "⚠️ Tagging failed for {}, keeping untagged file: {}",
                job.track.title,
                e
            );
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, cancel: &AtomicBool, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(AppError::Canceled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(AppError::Canceled) => return Err(AppError::Canceled),
                // Pointing the user at their server settings beats blind retries.
                Err(AppError::ServerUnreachable(url)) => {
                    return Err(AppError::ServerUnreachable(url))
                }
                Err(e) if attempt < self.settings.retry_attempts => {
                    log::warn!("⚠️ {} attempt {} failed: {} - retrying", what, attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn set_progress(&self, job_id: &str, title: &str, percent: u8) {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(job_id) {
                Some(job)
                    if job.status == DownloadStatus::Downloading && percent > job.progress =>
                {
                    job.progress = percent.min(100);
                    Some(job.clone())
                }
                _ => None,
            }
        };

        if let Some(job) = snapshot {
            if let Err(e) = self.store.upsert(&job).await {
                log::warn!("Failed to persist progress for {}: {}", job_id, e);
            }
            self.notifier.on_progress(job_id, title, job.progress, false);
            let _ = self.events.send(job);
        }
    }

    async fn transition(&self, job_id: &str, status: DownloadStatus) -> Option<DownloadJob> {
        let job = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(job_id)?;
            job.status = status;
            if matches!(status, DownloadStatus::Merging | DownloadStatus::Completed) {
                job.progress = 100;
            }
            job.clone()
        };

        if let Err(e) = self.store.upsert(&job).await {
            log::warn!("Failed to persist status for {}: {}", job_id, e);
        }
        let _ = self.events.send(job.clone());
        Some(job)
    }

    async fn finish_completed(&self, job_id: &str, path: PathBuf) {
        let job = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(job_id) {
                Some(job) => {
                    job.status = DownloadStatus::Completed;
                    job.progress = 100;
                    job.file_path = Some(path);
                    job.error = None;
                    job.clone()
                }
                None => return,
            }
        };

        if let Err(e) = self.store.upsert(&job).await {
            log::warn!("Failed to persist completion for {}: {}", job_id, e);
        }
        self.notifier.on_completed(job_id, &job.track.title);
        let _ = self.events.send(job.clone());
        self.cancel_flags.lock().await.remove(job_id);

        log::info!(
            "✅ Downloaded: {} -> {:?}",
            job.track.title,
            job.file_path
        );
    }

    async fn finish_failed(&self, job_id: &str, error: AppError) {
        let job = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(job_id) {
                Some(job) => {
                    job.status = DownloadStatus::Failed;
                    job.error = Some(error.to_string());
                    job.clone()
                }
                None => return,
            }
        };

        if let Err(e) = self.store.upsert(&job).await {
            log::warn!("Failed to persist failure for {}: {}", job_id, e);
        }
        self.notifier.on_failed(job_id, &job.track.title);
        let _ = self.events.send(job);
        self.cancel_flags.lock().await.remove(job_id);

        log::error!("❌ Download {} failed: {}", job_id, error);
    }

    async fn finish_canceled(&self, job_id: &str) {
        let removed = { self.jobs.lock().await.remove(job_id) };
        if removed.is_some() {
            if let Err(e) = self.store.delete(job_id).await {
                log::warn!("Failed to drop canceled record {}: {}", job_id, e);
            }
            self.notifier.on_canceled(job_id);
        }
        self.cancel_flags.lock().await.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeliveryMode, DownloadQuality, PlaybackInfo, TrackSummary};
    use crate::metadata::keys;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockCatalog {
        streams: usize,
        unreachable: bool,
        playback_calls: AtomicUsize,
    }

    impl Default for MockCatalog {
        fn default() -> Self {
            Self {
                streams: 1,
                unreachable: false,
                playback_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::api::CatalogApi for MockCatalog {
        async fn search_tracks(&self, _query: &str) -> Result<Vec<TrackSummary>> {
            Ok(vec![])
        }

        async fn search_albums(&self, _query: &str) -> Result<Vec<TrackSummary>> {
            Ok(vec![])
        }

        async fn album_tracks(&self, _album_id: i64) -> Result<Vec<TrackSummary>> {
            Ok(vec![track(201), track(202)])
        }

        async fn playback_info(
            &self,
            track_id: i64,
            _quality: DownloadQuality,
            _mode: Option<DeliveryMode>,
        ) -> Result<PlaybackInfo> {
            self.playback_calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(AppError::ServerUnreachable(
                    "http://localhost:8080".to_string(),
                ));
            }
            Ok(PlaybackInfo {
                id: track_id,
                quality: "LOSSLESS".to_string(),
                codec: Some("flac".to_string()),
                urls: (0..self.streams)
                    .map(|i| format!("mock://{}/{}", track_id, i))
                    .collect(),
                expires_at: None,
            })
        }

        async fn track_metadata(&self, _track_id: i64) -> Result<HashMap<String, String>> {
            let mut tags = HashMap::new();
            tags.insert(keys::TITLE.to_string(), "Mock Song".to_string());
            tags.insert(keys::ARTIST.to_string(), "Mock Artist".to_string());
            Ok(tags)
        }

        async fn preview_info(&self, _track_id: i64) -> Result<PlaybackInfo> {
            Err(AppError::NotFound("preview".to_string()))
        }

        async fn cover_art(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct MockFetcher {
        fail: bool,
        hang_until_cancel: bool,
        delay_ms: u64,
        attempts: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        started: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamFetcher for MockFetcher {
        async fn fetch(
            &self,
            url: &str,
            dest: &Path,
            cancel: &AtomicBool,
            progress: ProgressSink,
        ) -> Result<u64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push(url.to_string());

            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(running, Ordering::SeqCst);

            let result = self.fetch_inner(url, dest, cancel, progress).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl MockFetcher {
        async fn fetch_inner(
            &self,
            url: &str,
            dest: &Path,
            cancel: &AtomicBool,
            progress: ProgressSink,
        ) -> Result<u64> {
            if self.fail {
                return Err(AppError::Fetch {
                    url: url.to_string(),
                    cause: "mock failure".to_string(),
                });
            }

            if self.hang_until_cancel {
                progress(40);
                tokio::fs::write(dest, b"partial").await?;
                for _ in 0..500 {
                    if cancel.load(Ordering::SeqCst) {
                        let _ = tokio::fs::remove_file(dest).await;
                        return Err(AppError::Canceled);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                let _ = tokio::fs::remove_file(dest).await;
                return Err(AppError::Fetch {
                    url: url.to_string(),
                    cause: "mock never canceled".to_string(),
                });
            }

            for percent in [25u8, 50, 75] {
                if cancel.load(Ordering::SeqCst) {
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(AppError::Canceled);
                }
                progress(percent);
                if self.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                }
            }

            tokio::fs::write(dest, b"audio-bytes").await?;
            progress(100);
            Ok(11)
        }
    }

    #[derive(Default)]
    struct MockMerger {
        merges: AtomicUsize,
    }

    #[async_trait]
    impl StreamMerger for MockMerger {
        async fn merge(&self, streams: &[PathBuf], output: &Path) -> Result<PathBuf> {
            if streams.len() == 1 {
                return Ok(streams[0].clone());
            }
            self.merges.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(output, b"merged-bytes").await?;
            Ok(output.to_path_buf())
        }
    }

    #[derive(Default)]
    struct RecordingPresenter {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingPresenter {
        fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    impl NotificationPresenter for RecordingPresenter {
        fn on_created(&self, job_id: &str, _title: &str) {
            self.events.lock().unwrap().push(format!("created:{}", job_id));
        }

        fn on_progress(&self, _job_id: &str, _title: &str, _percent: u8, _indeterminate: bool) {}

        fn on_completed(&self, job_id: &str, _title: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("completed:{}", job_id));
        }

        fn on_failed(&self, job_id: &str, _title: &str) {
            self.events.lock().unwrap().push(format!("failed:{}", job_id));
        }

        fn on_canceled(&self, job_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("canceled:{}", job_id));
        }
    }

    struct Harness {
        manager: DownloadManager,
        store: Arc<MemoryJobStore>,
        presenter: Arc<RecordingPresenter>,
        catalog: Arc<MockCatalog>,
        fetcher: Arc<MockFetcher>,
        dir: tempfile::TempDir,
    }

    fn harness(
        streams: usize,
        fetcher: MockFetcher,
        max_concurrent: usize,
        retry_attempts: u32,
    ) -> Harness {
        harness_with(
            MockCatalog {
                streams,
                ..MockCatalog::default()
            },
            fetcher,
            max_concurrent,
            retry_attempts,
        )
    }

    fn harness_with(
        catalog: MockCatalog,
        fetcher: MockFetcher,
        max_concurrent: usize,
        retry_attempts: u32,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let presenter = Arc::new(RecordingPresenter::default());
        let catalog = Arc::new(catalog);
        let fetcher = Arc::new(fetcher);

        let settings = ManagerSettings {
            download_dir: dir.path().to_path_buf(),
            max_concurrent,
            retry_attempts,
            tag_options: TagOptions::default(),
        };

        let manager = DownloadManager::new(
            catalog.clone(),
            fetcher.clone(),
            Arc::new(MockMerger::default()),
            store.clone(),
            presenter.clone(),
            settings,
        );

        Harness {
            manager,
            store,
            presenter,
            catalog,
            fetcher,
            dir,
        }
    }

    fn track(id: i64) -> TrackSummary {
        TrackSummary {
            id,
            title: format!("Track {}", id),
            artists: vec!["Artist".to_string()],
            duration: "3:00".to_string(),
            explicit: false,
            cover: None,
            modes: Some(vec!["STEREO".to_string()]),
            formats: None,
        }
    }

    fn request(id: i64) -> DownloadRequest {
        DownloadRequest::Track {
            track: track(id),
            quality: DownloadQuality::Lossless,
        }
    }

    /// Collects (status, progress) snapshots for one job until it goes
    /// terminal.
    async fn collect_until_terminal(
        rx: &mut broadcast::Receiver<DownloadJob>,
        job_id: &str,
    ) -> Vec<(DownloadStatus, u8)> {
        let mut seen = Vec::new();
        loop {
            let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for job events")
                .expect("event stream closed");
            if job.id != job_id {
                continue;
            }
            let terminal = job.status.is_terminal();
            seen.push((job.status, job.progress));
            if terminal {
                return seen;
            }
        }
    }

    async fn wait_for_removal(manager: &DownloadManager, job_id: &str) {
        for _ in 0..500 {
            if manager.job(job_id).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} was never removed", job_id);
    }

    #[tokio::test]
    async fn single_stream_job_completes_without_merging() {
        let h = harness(1, MockFetcher::default(), 1, 3);
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(1)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;

        assert!(seen.iter().all(|(status, _)| *status != DownloadStatus::Merging));
        let (status, progress) = seen.last().unwrap();
        assert_eq!(*status, DownloadStatus::Completed);
        assert_eq!(*progress, 100);

        let job = h.manager.job(&ids[0]).await.unwrap();
        let path = job.file_path.expect("completed job must carry a file path");
        assert_eq!(path, h.dir.path().join("Mock Artist - Mock Song.flac"));
        assert_eq!(std::fs::read(&path).unwrap(), b"audio-bytes");

        let stored = h.store.list_all().await.unwrap();
        assert_eq!(stored[0].status, DownloadStatus::Completed);
        assert_eq!(h.presenter.count("completed:"), 1);
    }

    #[tokio::test]
    async fn multi_stream_job_goes_through_merging() {
        let h = harness(2, MockFetcher::default(), 1, 3);
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(2)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;

        let merging: Vec<_> = seen
            .iter()
            .filter(|(status, _)| *status == DownloadStatus::Merging)
            .collect();
        assert!(!merging.is_empty());
        // Progress is pinned to 100 for the whole merging phase.
        assert!(merging.iter().all(|(_, progress)| *progress == 100));

        let (status, _) = seen.last().unwrap();
        assert_eq!(*status, DownloadStatus::Completed);

        let job = h.manager.job(&ids[0]).await.unwrap();
        let path = job.file_path.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"merged-bytes");
    }

    #[tokio::test]
    async fn duplicate_submit_reuses_the_active_job() {
        let h = harness(
            1,
            MockFetcher {
                delay_ms: 30,
                ..MockFetcher::default()
            },
            1,
            3,
        );
        let mut rx = h.manager.subscribe();

        let first = h.manager.submit(request(3)).await.unwrap();
        let second = h.manager.submit(request(3)).await.unwrap();
        assert_eq!(first, second);

        collect_until_terminal(&mut rx, &first[0]).await;

        assert_eq!(h.manager.jobs().await.len(), 1);
        assert_eq!(h.presenter.count("created:"), 1);
        assert_eq!(h.presenter.count("completed:"), 1);
    }

    #[tokio::test]
    async fn fetch_failure_exhausts_retries_then_fails() {
        let h = harness(
            1,
            MockFetcher {
                fail: true,
                ..MockFetcher::default()
            },
            1,
            2,
        );
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(4)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;

        let (status, _) = seen.last().unwrap();
        assert_eq!(*status, DownloadStatus::Failed);

        let job = h.manager.job(&ids[0]).await.unwrap();
        assert!(job.file_path.is_none());
        assert!(job.error.is_some());

        assert_eq!(h.fetcher.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.presenter.count("failed:"), 1);
        assert_eq!(h.presenter.count("completed:"), 0);
    }

    #[tokio::test]
    async fn cancel_mid_download_leaves_no_record_and_no_partial_file() {
        let h = harness(
            1,
            MockFetcher {
                hang_until_cancel: true,
                ..MockFetcher::default()
            },
            1,
            3,
        );
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(5)).await.unwrap();
        let job_id = &ids[0];

        // Wait for the job to report mid-transfer progress.
        loop {
            let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for progress")
                .expect("event stream closed");
            if job.id == *job_id && job.progress >= 40 {
                break;
            }
        }

        h.manager.cancel(job_id).await.unwrap();
        wait_for_removal(&h.manager, job_id).await;

        assert!(h.store.list_all().await.unwrap().is_empty());
        assert_eq!(h.presenter.count("canceled:"), 1);
        assert_eq!(h.presenter.count("completed:"), 0);
        assert_eq!(h.presenter.count("failed:"), 0);

        // Scratch space is cleaned up with the job.
        let leftover: Vec<_> = std::fs::read_dir(h.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftover.is_empty(), "unexpected files: {:?}", leftover);
    }

    #[tokio::test]
    async fn worker_pool_bound_is_respected() {
        let h = harness(
            1,
            MockFetcher {
                delay_ms: 30,
                ..MockFetcher::default()
            },
            2,
            3,
        );
        let mut rx = h.manager.subscribe();

        let mut ids = Vec::new();
        for track_id in 10..14 {
            ids.extend(h.manager.submit(request(track_id)).await.unwrap());
        }
        for id in &ids {
            // Events for already-terminal jobs were drained by earlier calls,
            // so guard with the job map too.
            if h.manager.job(id).await.map(|j| j.status.is_terminal()) != Some(true) {
                collect_until_terminal(&mut rx, id).await;
            }
        }

        assert!(h.fetcher.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.presenter.count("completed:"), 4);
    }

    #[tokio::test]
    async fn single_worker_drains_queue_in_submission_order() {
        let h = harness(
            1,
            MockFetcher {
                delay_ms: 10,
                ..MockFetcher::default()
            },
            1,
            3,
        );
        let mut rx = h.manager.subscribe();

        let mut ids = Vec::new();
        for track_id in [21, 22, 23] {
            ids.extend(h.manager.submit(request(track_id)).await.unwrap());
        }
        for id in &ids {
            if h.manager.job(id).await.map(|j| j.status.is_terminal()) != Some(true) {
                collect_until_terminal(&mut rx, id).await;
            }
        }

        let started = h.fetcher.started.lock().unwrap().clone();
        assert_eq!(
            started,
            vec![
                "mock://21/0".to_string(),
                "mock://22/0".to_string(),
                "mock://23/0".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn album_request_fans_out_into_track_jobs() {
        let h = harness(1, MockFetcher::default(), 2, 3);
        let mut rx = h.manager.subscribe();

        let ids = h
            .manager
            .submit(DownloadRequest::Album {
                album_id: 900,
                quality: DownloadQuality::Lossless,
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        for id in &ids {
            if h.manager.job(id).await.map(|j| j.status.is_terminal()) != Some(true) {
                collect_until_terminal(&mut rx, id).await;
            }
        }
        assert_eq!(h.presenter.count("completed:"), 2);
    }

    #[tokio::test]
    async fn progress_is_monotonic_while_downloading() {
        let h = harness(2, MockFetcher::default(), 1, 3);
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(6)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;

        let downloading: Vec<u8> = seen
            .iter()
            .filter(|(status, _)| *status == DownloadStatus::Downloading)
            .map(|(_, progress)| *progress)
            .collect();
        assert!(downloading.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn mark_deleted_requires_completion_and_clears_path() {
        let h = harness(1, MockFetcher::default(), 1, 3);
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(7)).await.unwrap();
        collect_until_terminal(&mut rx, &ids[0]).await;

        h.manager.mark_deleted(&ids[0]).await.unwrap();
        let job = h.manager.job(&ids[0]).await.unwrap();
        assert_eq!(job.status, DownloadStatus::Deleted);
        assert!(job.file_path.is_none());

        // Deleting twice is rejected: the job is no longer completed.
        assert!(h.manager.mark_deleted(&ids[0]).await.is_err());
    }

    #[tokio::test]
    async fn resubmit_after_terminal_state_creates_a_fresh_job() {
        let h = harness(
            1,
            MockFetcher {
                fail: true,
                ..MockFetcher::default()
            },
            1,
            1,
        );
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(8)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;
        assert_eq!(seen.last().unwrap().0, DownloadStatus::Failed);

        // Same derived id, fresh record.
        let again = h.manager.submit(request(8)).await.unwrap();
        assert_eq!(again, ids);
        let seen = collect_until_terminal(&mut rx, &again[0]).await;
        assert_eq!(seen.first().unwrap().0, DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn tag_failure_keeps_the_completed_download() {
        // The mock fetcher writes a payload lofty cannot probe, so the tag
        // pass fails on every run; the download must complete anyway.
        let h = harness(1, MockFetcher::default(), 1, 3);
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(30)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;

        assert_eq!(seen.last().unwrap().0, DownloadStatus::Completed);
        let job = h.manager.job(&ids[0]).await.unwrap();
        let path = job.file_path.expect("untagged download still gets a path");
        assert_eq!(std::fs::read(&path).unwrap(), b"audio-bytes");
        assert_eq!(h.presenter.count("failed:"), 0);
    }

    #[tokio::test]
    async fn unreachable_server_fails_fast_without_retries() {
        let h = harness_with(
            MockCatalog {
                unreachable: true,
                ..MockCatalog::default()
            },
            MockFetcher::default(),
            1,
            3,
        );
        let mut rx = h.manager.subscribe();

        let ids = h.manager.submit(request(31)).await.unwrap();
        let seen = collect_until_terminal(&mut rx, &ids[0]).await;
        assert_eq!(seen.last().unwrap().0, DownloadStatus::Failed);

        // The settings-hint error is terminal on the first attempt.
        assert_eq!(h.catalog.playback_calls.load(Ordering::SeqCst), 1);
        let job = h.manager.job(&ids[0]).await.unwrap();
        assert!(job.error.unwrap().contains("unreachable"));
        assert_eq!(h.fetcher.attempts.load(Ordering::SeqCst), 0);
    }
}
