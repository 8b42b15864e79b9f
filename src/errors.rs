use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Catalog server at {0} is unreachable - check the server URL in your settings")]
    ServerUnreachable(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Failed to resolve track info: {0}")]
    MetadataResolution(String),

    #[error("Fetch error for {url}: {cause}")]
    Fetch { url: String, cause: String },

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Tag error: {0}")]
    Tag(#[from] lofty::LoftyError),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Download canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, AppError>;
