pub mod fetcher;
pub mod manager;
pub mod merger;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::api::{DownloadQuality, TrackSummary};

/// A user-issued download request, either one track or a whole album.
///
/// Album requests fan out into independent per-track jobs sharing the same
/// queue; partial album completion is expected.
#[derive(Debug, Clone)]
pub enum DownloadRequest {
    Track {
        track: TrackSummary,
        quality: DownloadQuality,
    },
    Album {
        album_id: i64,
        quality: DownloadQuality,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Merging,
    Completed,
    Failed,
    /// A previously completed file the user removed from disk.
    Deleted,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "QUEUED",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Merging => "MERGING",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Failed => "FAILED",
            DownloadStatus::Deleted => "DELETED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(DownloadStatus::Queued),
            "DOWNLOADING" => Some(DownloadStatus::Downloading),
            "MERGING" => Some(DownloadStatus::Merging),
            "COMPLETED" => Some(DownloadStatus::Completed),
            "FAILED" => Some(DownloadStatus::Failed),
            "DELETED" => Some(DownloadStatus::Deleted),
            _ => None,
        }
    }
}

/// One download attempt for a single track at a single quality.
///
/// Mutated only by the worker that owns it; everyone else sees snapshots.
/// `file_path` is set exactly when the job is Completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub track: TrackSummary,
    pub quality: DownloadQuality,
    pub status: DownloadStatus,
    pub progress: u8,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadJob {
    pub fn new(id: String, track: TrackSummary, quality: DownloadQuality) -> Self {
        Self {
            id,
            track,
            quality,
            status: DownloadStatus::Queued,
            progress: 0,
            file_path: None,
            error: None,
            created_at: chrono::Utc::now(),
        }
    }
}
