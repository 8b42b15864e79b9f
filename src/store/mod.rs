use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::api::{DownloadQuality, TrackSummary};
use crate::downloader::{DownloadJob, DownloadStatus};
use crate::errors::{AppError, Result};

/// Durable record keeping for download jobs, one row per derived job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, job: &DownloadJob) -> Result<()>;
    async fn list_all(&self) -> Result<Vec<DownloadJob>>;
    async fn delete(&self, job_id: &str) -> Result<()>;
}

/// SQLite-backed store. The track summary is denormalized into the row so
/// history stays readable even if the catalog entry changes later.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                track_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                artists TEXT NOT NULL,
                duration TEXT NOT NULL,
                explicit INTEGER NOT NULL DEFAULT 0,
                cover TEXT,
                modes TEXT,
                formats TEXT,
                quality TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                file_path TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_job(row: RawRow) -> Option<DownloadJob> {
        let status = DownloadStatus::from_str(&row.status)?;
        let quality = DownloadQuality::from_param(&row.quality)?;
        let artists: Vec<String> = serde_json::from_str(&row.artists).ok()?;
        let modes = row
            .modes
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok());
        let formats = row
            .formats
            .as_deref()
            .and_then(|f| serde_json::from_str(f).ok());
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .ok()?
            .with_timezone(&Utc);

        Some(DownloadJob {
            id: row.id,
            track: TrackSummary {
                id: row.track_id,
                title: row.title,
                artists,
                duration: row.duration,
                explicit: row.explicit != 0,
                cover: row.cover,
                modes,
                formats,
            },
            quality,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            file_path: row.file_path.map(Into::into),
            error: row.error,
            created_at,
        })
    }
}

struct RawRow {
    id: String,
    track_id: i64,
    title: String,
    artists: String,
    duration: String,
    explicit: i64,
    cover: Option<String>,
    modes: Option<String>,
    formats: Option<String>,
    quality: String,
    status: String,
    progress: i64,
    file_path: Option<String>,
    error: Option<String>,
    created_at: String,
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn upsert(&self, job: &DownloadJob) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO downloads
               (id, track_id, title, artists, duration, explicit, cover, modes,
                formats, quality, status, progress, file_path, error, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                job.id,
                job.track.id,
                job.track.title,
                serde_json::to_string(&job.track.artists)?,
                job.track.duration,
                job.track.explicit as i64,
                job.track.cover,
                job.track
                    .modes
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.track
                    .formats
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.quality.as_param(),
                job.status.as_str(),
                job.progress as i64,
                job.file_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                job.error,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<DownloadJob>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT id, track_id, title, artists, duration, explicit, cover,
                      modes, formats, quality, status, progress, file_path,
                      error, created_at
               FROM downloads ORDER BY created_at ASC"#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                track_id: row.get(1)?,
                title: row.get(2)?,
                artists: row.get(3)?,
                duration: row.get(4)?,
                explicit: row.get(5)?,
                cover: row.get(6)?,
                modes: row.get(7)?,
                formats: row.get(8)?,
                quality: row.get(9)?,
                status: row.get(10)?,
                progress: row.get(11)?,
                file_path: row.get(12)?,
                error: row.get(13)?,
                created_at: row.get(14)?,
            })
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let row = row?;
            match Self::row_to_job(row) {
                Some(job) => jobs.push(job),
                None => log::warn!("Skipping unreadable download record"),
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![job_id])?;
        Ok(())
    }
}

/// In-memory store for tests and throwaway sessions.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, DownloadJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: &DownloadJob) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<DownloadJob>> {
        let mut jobs: Vec<DownloadJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }
}

/// Accepts the user-side "file was deleted" event for a completed record.
pub async fn mark_record_deleted(store: &dyn JobStore, job_id: &str) -> Result<()> {
    let jobs = store.list_all().await?;
    let Some(mut job) = jobs.into_iter().find(|j| j.id == job_id) else {
        return Err(AppError::NotFound(format!("download {}", job_id)));
    };

    if job.status != DownloadStatus::Completed {
        return Err(AppError::InvalidInput(format!(
            "download {} is not completed",
            job_id
        )));
    }

    job.status = DownloadStatus::Deleted;
    job.file_path = None;
    store.upsert(&job).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str) -> DownloadJob {
        DownloadJob::new(
            id.to_string(),
            TrackSummary {
                id: 99,
                title: "Song".to_string(),
                artists: vec!["Artist".to_string()],
                duration: "2:30".to_string(),
                explicit: true,
                cover: Some("http://example/cover.jpg".to_string()),
                modes: Some(vec!["STEREO".to_string()]),
                formats: None,
            },
            DownloadQuality::HiRes,
        )
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(&dir.path().join("downloads.db")).unwrap();

        let mut job = sample_job("99-HI_RES_LOSSLESS");
        store.upsert(&job).await.unwrap();

        job.status = DownloadStatus::Completed;
        job.progress = 100;
        job.file_path = Some("/music/Artist - Song.flac".into());
        store.upsert(&job).await.unwrap();

        let jobs = store.list_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, DownloadStatus::Completed);
        assert_eq!(jobs[0].progress, 100);
        assert_eq!(jobs[0].track.artists, vec!["Artist".to_string()]);
        assert!(jobs[0].file_path.is_some());

        store.delete(&job.id).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_marking_requires_completed_status() {
        let store = MemoryJobStore::new();
        let job = sample_job("99-HI_RES_LOSSLESS");
        store.upsert(&job).await.unwrap();

        let result = mark_record_deleted(&store, &job.id).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let mut completed = job.clone();
        completed.status = DownloadStatus::Completed;
        completed.file_path = Some("/music/x.flac".into());
        store.upsert(&completed).await.unwrap();

        mark_record_deleted(&store, &job.id).await.unwrap();
        let jobs = store.list_all().await.unwrap();
        assert_eq!(jobs[0].status, DownloadStatus::Deleted);
        assert!(jobs[0].file_path.is_none());
    }
}
