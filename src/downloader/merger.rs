use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{AppError, Result};

/// Combines the elementary streams fetched for one track into a single
/// playable container.
#[async_trait]
pub trait StreamMerger: Send + Sync {
    /// `streams` is ordered: the first entry is the primary audio stream and
    /// must stay the default track of the output. With a single stream this
    /// is a pass-through and the input path is returned unchanged.
    async fn merge(&self, streams: &[PathBuf], output: &Path) -> Result<PathBuf>;
}

/// Remuxes elementary streams with ffmpeg, stream-copying so the audio
/// payload is never re-encoded.
pub struct FfmpegMerger {
    ffmpeg_path: String,
}

impl FfmpegMerger {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }

    pub fn with_ffmpeg_path(mut self, path: String) -> Self {
        self.ffmpeg_path = path;
        self
    }
}

impl Default for FfmpegMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamMerger for FfmpegMerger {
    async fn merge(&self, streams: &[PathBuf], output: &Path) -> Result<PathBuf> {
        match streams {
            [] => Err(AppError::Merge("no streams to merge".to_string())),
            [single] => Ok(single.clone()),
            many => {
                let mut cmd = tokio::process::Command::new(&self.ffmpeg_path);
                for stream in many {
                    cmd.arg("-i").arg(stream);
                }
                // Map inputs in order so the primary audio stream stays first.
                for index in 0..many.len() {
                    cmd.arg("-map").arg(index.to_string());
                }
                cmd.arg("-c").arg("copy").arg("-y").arg(output);

                log::debug!("Running ffmpeg merge of {} streams into {:?}", many.len(), output);

                let result = cmd.output().await.map_err(|e| {
                    AppError::Merge(format!("failed to run {}: {}", self.ffmpeg_path, e))
                })?;

                if !result.status.success() {
                    let stderr = String::from_utf8_lossy(&result.stderr);
                    return Err(AppError::Merge(format!(
                        "ffmpeg exited with {}: {}",
                        result.status,
                        stderr.trim()
                    )));
                }

                Ok(output.to_path_buf())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_stream_is_passed_through() {
        let merger = FfmpegMerger::new();
        let input = PathBuf::from("/tmp/stream-0.m4a");
        let output = PathBuf::from("/tmp/merged.m4a");

        let result = merger.merge(std::slice::from_ref(&input), &output).await;
        assert_eq!(result.unwrap(), input);
    }

    #[tokio::test]
    async fn empty_stream_list_is_rejected() {
        let merger = FfmpegMerger::new();
        let result = merger.merge(&[], Path::new("/tmp/out.m4a")).await;
        assert!(matches!(result, Err(AppError::Merge(_))));
    }
}
