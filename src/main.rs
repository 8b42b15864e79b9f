use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use tokio::sync::broadcast;

use cantata::api::{CatalogApi, CatalogClient, DownloadQuality, TrackSummary};
use cantata::config::AppConfig;
use cantata::downloader::fetcher::{HttpStreamFetcher, StreamFetcher};
use cantata::downloader::manager::{DownloadManager, ManagerSettings};
use cantata::downloader::merger::FfmpegMerger;
use cantata::downloader::{DownloadRequest, DownloadStatus};
use cantata::errors::{AppError, Result};
use cantata::notification::LogPresenter;
use cantata::store::{JobStore, SqliteJobStore};
use cantata::utils::ensure_dir_exists;

#[derive(Parser)]
#[command(
    name = "cantata",
    version,
    about = "Search a music catalog and download tracks with tags, cover art and lyrics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the catalog
    Search {
        query: String,
        /// Search albums instead of tracks
        #[arg(long)]
        albums: bool,
    },
    /// List the tracks of an album
    Album { id: i64 },
    /// Download tracks matching a search query
    Download {
        query: String,
        /// Treat the query as an album search and download the whole album
        #[arg(long)]
        album: bool,
        /// Which search result to use
        #[arg(long, default_value_t = 0)]
        pick: usize,
        /// Quality tier, defaults to the configured preference
        #[arg(long, value_enum)]
        quality: Option<DownloadQuality>,
    },
    /// Download the short preview clip of a track
    Preview { id: i64 },
    /// Show the persisted download history
    History,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    if let Err(e) = run(cli, config).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let catalog = CatalogClient::new(&config.server_url)?;

    match cli.command {
        Commands::Search { query, albums } => {
            let results = if albums {
                catalog.search_albums(&query).await?
            } else {
                catalog.search_tracks(&query).await?
            };
            print_summaries(&results);
        }
        Commands::Album { id } => {
            let tracks = catalog.album_tracks(id).await?;
            print_summaries(&tracks);
        }
        Commands::Download {
            query,
            album,
            pick,
            quality,
        } => {
            let quality = quality.unwrap_or(config.preferred_quality);
            let request = if album {
                let albums = catalog.search_albums(&query).await?;
                let chosen = albums
                    .get(pick)
                    .ok_or_else(|| AppError::NotFound(format!("album result #{}", pick)))?;
                info!(
                    "Downloading album: {} - {}",
                    chosen.artist_line(),
                    chosen.title
                );
                DownloadRequest::Album {
                    album_id: chosen.id,
                    quality,
                }
            } else {
                let tracks = catalog.search_tracks(&query).await?;
                let chosen = tracks
                    .get(pick)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("track result #{}", pick)))?;
                info!(
                    "Downloading track: {} - {}",
                    chosen.artist_line(),
                    chosen.title
                );
                DownloadRequest::Track {
                    track: chosen,
                    quality,
                }
            };
            download(request, Arc::new(catalog), &config).await?;
        }
        Commands::Preview { id } => preview(&catalog, id, &config).await?,
        Commands::History => history().await?,
    }

    Ok(())
}

/// Runs the download pipeline for one request and renders live progress
/// until every submitted job reaches a terminal state.
async fn download(
    request: DownloadRequest,
    catalog: Arc<dyn CatalogApi>,
    config: &AppConfig,
) -> Result<()> {
    let store = Arc::new(SqliteJobStore::new(&AppConfig::history_db_path()?)?);
    let notifier = Arc::new(LogPresenter::new());
    let fetcher = Arc::new(HttpStreamFetcher::new()?);
    let merger = Arc::new(FfmpegMerger::new());

    let manager = DownloadManager::new(
        catalog,
        fetcher,
        merger,
        store,
        notifier,
        ManagerSettings::from_config(config),
    );
    manager.recover_stale().await?;

    let mut events = manager.subscribe();
    let job_ids = manager.submit(request).await?;
    let mut pending: HashSet<String> = job_ids.into_iter().collect();

    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{msg:40!} [{bar:30}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    while !pending.is_empty() {
        let job = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, canceling {} download(s)", pending.len());
                cancel_all(&manager, &pending).await;
                for bar in bars.values() {
                    bar.abandon();
                }
                break;
            }
            event = events.recv() => match event {
                Ok(job) => job,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if !pending.contains(&job.id) {
            continue;
        }

        let bar = bars.entry(job.id.clone()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_message(format!("{} - {}", job.track.artist_line(), job.track.title));
            bar
        });
        bar.set_position(job.progress as u64);

        match job.status {
            DownloadStatus::Merging => {
                bar.set_message(format!("Merging {}", job.track.title));
            }
            DownloadStatus::Completed => {
                bar.finish_with_message(format!("Done: {}", job.track.title));
                pending.remove(&job.id);
            }
            DownloadStatus::Failed => {
                bar.abandon_with_message(format!("Failed: {}", job.track.title));
                pending.remove(&job.id);
            }
            DownloadStatus::Deleted => {
                pending.remove(&job.id);
            }
            DownloadStatus::Queued | DownloadStatus::Downloading => {}
        }
    }

    Ok(())
}

/// Flags every pending job for cancellation, then waits until each worker
/// has cleaned up (or the job had already gone terminal).
async fn cancel_all(manager: &DownloadManager, pending: &HashSet<String>) {
    for id in pending {
        if let Err(e) = manager.cancel(id).await {
            log::debug!("Cancel {}: {}", id, e);
        }
    }

    for id in pending {
        for _ in 0..100 {
            match manager.job(id).await {
                None => break,
                Some(job) if job.status.is_terminal() => break,
                Some(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        }
    }
}

async fn preview(catalog: &CatalogClient, track_id: i64, config: &AppConfig) -> Result<()> {
    let playback = catalog.preview_info(track_id).await?;
    let url = playback
        .urls
        .first()
        .ok_or_else(|| AppError::NotFound("preview stream".to_string()))?;

    ensure_dir_exists(&config.download_path).await?;
    let dest = config
        .download_path
        .join(format!("preview-{}.{}", track_id, playback.file_extension()));

    let fetcher = HttpStreamFetcher::new()?;
    let cancel = AtomicBool::new(false);
    let bytes = fetcher.fetch(url, &dest, &cancel, Box::new(|_| {})).await?;

    info!("Saved {} byte preview to {:?}", bytes, dest);
    Ok(())
}

async fn history() -> Result<()> {
    let store = SqliteJobStore::new(&AppConfig::history_db_path()?)?;
    let jobs = store.list_all().await?;

    if jobs.is_empty() {
        println!("No downloads recorded");
        return Ok(());
    }

    for job in jobs {
        println!(
            "{:11} {:>4}% {} - {} [{}]{}",
            job.status.as_str(),
            job.progress,
            job.track.artist_line(),
            job.track.title,
            job.quality,
            job.file_path
                .map(|p| format!(" -> {}", p.display()))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_summaries(results: &[TrackSummary]) {
    if results.is_empty() {
        println!("No results");
        return;
    }

    for (index, item) in results.iter().enumerate() {
        let explicit = if item.explicit { " [E]" } else { "" };
        println!(
            "{:3}. [{}] {} - {} ({}){}",
            index,
            item.id,
            item.artist_line(),
            item.title,
            item.duration,
            explicit
        );
    }
}
