use crate::api::DownloadQuality;
use crate::errors::Result;
use log::info;

/// Sanitizes a filename by removing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Derived download id for one track at one quality.
///
/// Deterministic so repeat requests for the same track and quality coalesce
/// onto a single job instead of duplicating work.
pub fn job_id_for(track_id: i64, quality: DownloadQuality) -> String {
    format!("{}-{}", track_id, quality.as_param())
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}
