use anyhow::Result;
use backoff::ExponentialBackoffBuilder;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

mod bridge;
mod config;
mod database;
mod detect;
mod dom;
mod error;
mod extract;
mod gate;
mod host;
mod loader;
mod models;
mod queue;
mod resolver;
mod session;
mod sites;
mod storage;
mod traits;
mod upscaler;
mod utils;

use config::Config;
use database::Database;
use dom::Document;
use error::LiftError;
use loader::ImageLoader;
use models::{NoticeLevel, UiEvent};
use session::PageSession;
use traits::UpscaleService;
use upscaler::{HealthStatus, UpscaleClient};
use utils::HttpClient;

#[derive(Parser)]
#[command(name = "mangalift")]
#[command(about = "Detect manga pages on a reader page and upscale them with a local service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "mangalift.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a reader page, detect its pages and upscale them in reading order
    Scan {
        /// Page URL
        url: String,
        /// Wait for the upscale service to come up before starting
        #[arg(short, long)]
        wait: bool,
        /// Directory for upscaled images (overrides the config)
        #[arg(short, long)]
        output: Option<String>,
        /// Zip the upscaled pages when done
        #[arg(short, long)]
        archive: bool,
    },
    /// Check whether the upscale service is up
    Health,
    /// Service cache statistics and lifetime totals
    Stats,
    /// List upscale models
    Models,
    /// Switch the active upscale model
    SwitchModel {
        /// Model id (e.g. "slow" or "fast")
        model: String,
    },
    /// Clear the service's result cache
    ClearCache,
    /// Show recent page sessions
    History {
        #[arg(default_value = "10")]
        limit: i64,
    },
    /// Write a default configuration file and create the database
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            info!("Initializing mangalift...");
            if Path::new(&cli.config).exists() {
                info!("Keeping existing configuration at {}", cli.config);
            } else {
                config.save(&cli.config)?;
                info!("Wrote default configuration to {}", cli.config);
            }
            let db = Database::new(&config.database.url, config.database.max_connections).await?;
            db.init().await?;
            info!("Database initialized successfully");
        }
        Commands::Scan { url, wait, output, archive } => {
            if let Some(output) = output {
                config.storage.output_path = output;
            }
            if archive {
                config.storage.archive = true;
            }
            run_scan(&config, &url, wait).await?;
        }
        Commands::Health => {
            let client = UpscaleClient::new(&config.server)?;
            match client.health().await {
                Ok(health) => print_health(&health),
                Err(e) => println!("❌ {}", e.user_message()),
            }
        }
        Commands::Stats => {
            show_stats(&config).await?;
        }
        Commands::Models => {
            let client = UpscaleClient::new(&config.server)?;
            let list = client.models().await?;
            println!("{:<3} {:<8} {:<24} {:<10} {}", "", "Id", "Name", "Available", "Description");
            println!("{}", "-".repeat(80));
            for model in list.models {
                println!(
                    "{:<3} {:<8} {:<24} {:<10} {}",
                    if model.active { "*" } else { "" },
                    model.id,
                    model.name,
                    if model.available { "yes" } else { "no" },
                    model.description
                );
            }
            if list.loading {
                println!("⏳ A model is currently loading");
            }
        }
        Commands::SwitchModel { model } => {
            let client = UpscaleClient::new(&config.server)?;
            let message = client.switch_model(&model).await?;
            println!("✅ {}", message);
        }
        Commands::ClearCache => {
            let client = UpscaleClient::new(&config.server)?;
            let message = client.clear_cache().await?;
            println!("🧹 {}", message);
        }
        Commands::History { limit } => {
            let db = Database::new(&config.database.url, config.database.max_connections).await?;
            db.init().await?;
            show_history(&db, limit).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(format!("mangalift={}", level))
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    Ok(())
}

/// Polls `/health` with exponential backoff until the service reports a loaded model.
async fn wait_for_service(client: &UpscaleClient, max_wait: Duration) -> Result<HealthStatus> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(max_wait))
        .build();

    let health = backoff::future::retry(policy, || async {
        match client.health().await {
            Ok(health) if health.is_healthy() && health.model_loaded => Ok(health),
            Ok(health) => {
                info!("Upscale service is up but not ready (model loading: {})", health.model_loading);
                Err(backoff::Error::transient(LiftError::service_unavailable("model not loaded")))
            }
            Err(e) => {
                info!("Waiting for upscale service: {}", e);
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await?;

    Ok(health)
}

async fn run_scan(config: &Config, url: &str, wait: bool) -> Result<()> {
    let client = Arc::new(UpscaleClient::new(&config.server)?);
    if wait {
        let health = wait_for_service(&client, config.server.upscale_timeout()).await?;
        print_health(&health);
    }

    let db = Database::new(&config.database.url, config.database.max_connections).await?;
    db.init().await?;

    let http = HttpClient::new(&config.extract, config.server.request_timeout())?;
    let (location, html) = http.get_page(url).await?;
    let document = Document::parse(location.clone(), &html);

    let session = PageSession::open(document.clone(), config, client, Some(Arc::new(db)))?;
    println!("📖 {} ({})", location, session.site().name());
    info!("Page session {}", session.id());

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let progress = tokio::spawn(follow_progress(session.subscribe(), pb.clone()));

    let loader = ImageLoader::new(http, config.extract.probe_per_second, Some(location.to_string()));
    loader.load_all(session.site(), document.images()).await;
    session.wait_settled(Duration::from_millis(500)).await;

    let snapshot = session.snapshot();
    let output_dir = session.output_dir().map(Path::to_path_buf);
    let archive = session.dispose().await?;
    progress.abort();
    pb.finish_with_message("done");

    println!("{:<12} {:<10} {:<10} {:<12}", "Detected", "Upscaled", "Failed", "Avg time");
    println!("{}", "-".repeat(46));
    println!(
        "{:<12} {:<10} {:<10} {:<12}",
        snapshot.stats.total_detected,
        snapshot.stats.total_upscaled,
        snapshot.stats.total_failed,
        snapshot
            .average_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(dir) = output_dir.filter(|_| snapshot.stats.total_upscaled > 0) {
        println!("💾 Saved to {}", dir.display());
    }
    if let Some(archive) = archive {
        println!("📦 Archive: {}", archive.display());
    }

    Ok(())
}

async fn follow_progress(mut events: tokio::sync::broadcast::Receiver<UiEvent>, pb: ProgressBar) {
    loop {
        match events.recv().await {
            Ok(UiEvent::Progress(snapshot)) => {
                pb.set_length(snapshot.stats.total_detected as u64);
                pb.set_position((snapshot.stats.total_upscaled + snapshot.stats.total_failed) as u64);
                if let Some(current) = &snapshot.current {
                    pb.set_message(format!("{} ({}%)", current.status, current.progress));
                }
            }
            Ok(UiEvent::Notice(notice)) => {
                let icon = match notice.level {
                    NoticeLevel::Info => "ℹ️",
                    NoticeLevel::Warning => "⚠️",
                    NoticeLevel::Error => "❌",
                };
                pb.println(format!("{} {}", icon, notice.message));
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_health(health: &HealthStatus) {
    let icon = if health.is_healthy() { "✅" } else { "❌" };
    println!("{} Upscale service: {}", icon, health.status);
    println!(
        "   GPU: {}",
        if health.gpu_available {
            health.gpu_name.as_deref().unwrap_or("available")
        } else {
            "not available (CPU mode)"
        }
    );
    match (&health.model_name, health.model_loading) {
        (_, true) => println!("   Model: loading..."),
        (Some(name), false) => println!("   Model: {}", name),
        (None, false) => println!("   Model: {}", if health.model_loaded { "loaded" } else { "not loaded" }),
    }
}

async fn show_stats(config: &Config) -> Result<()> {
    let client = UpscaleClient::new(&config.server)?;
    match client.stats().await {
        Ok(stats) => {
            println!("🖥️  Service cache: {} files, {:.2} MB", stats.cache_count, stats.cache_size_mb);
            if let Some(model) = stats.model_name.or(stats.current_model) {
                println!("   Model: {}", model);
            }
        }
        Err(e) => warn!("Could not read service stats: {}", e),
    }

    let db = Database::new(&config.database.url, config.database.max_connections).await?;
    db.init().await?;
    let totals = db.lifetime_totals().await?;
    println!(
        "📊 {} sessions: {} detected, {} upscaled, {} failed",
        totals.sessions, totals.detected, totals.upscaled, totals.failed
    );
    Ok(())
}

async fn show_history(db: &Database, limit: i64) -> Result<()> {
    let sessions = db.recent_sessions(limit).await?;
    println!("{:<20} {:<14} {:<10} {:<8} {:<8} {}", "When", "Site", "Upscaled", "Failed", "Avg", "Page");
    println!("{}", "-".repeat(90));
    for session in sessions {
        println!(
            "{:<20} {:<14} {:<10} {:<8} {:<8} {}",
            session.updated_at.format("%Y-%m-%d %H:%M"),
            session.site,
            format!("{}/{}", session.total_upscaled, session.total_detected),
            session.total_failed,
            session
                .average_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string()),
            session.page_url
        );
    }
    Ok(())
}
