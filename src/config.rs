use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::api::DownloadQuality;
use crate::errors::{AppError, Result};
use crate::metadata::FileNamingFormat;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub server_url: String,
    pub download_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub retry_attempts: u32,
    pub preferred_quality: DownloadQuality,
    pub embed_cover_art: bool,
    pub embed_lyrics: bool,
    pub file_naming_format: FileNamingFormat,
    pub include_track_number: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads")),
            max_concurrent_downloads: 3,
            retry_attempts: 3,
            preferred_quality: DownloadQuality::Lossless,
            embed_cover_art: true,
            embed_lyrics: true,
            file_naming_format: FileNamingFormat::ArtistTitle,
            include_track_number: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            AppError::Config(config::ConfigError::Message(
                "Could not find config directory".to_string(),
            ))
        })?;

        Ok(config_dir.join("cantata").join("config.json"))
    }

    /// Location of the download history database.
    pub fn history_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            AppError::Config(config::ConfigError::Message(
                "Could not find data directory".to_string(),
            ))
        })?;

        Ok(data_dir.join("cantata").join("downloads.db"))
    }
}
