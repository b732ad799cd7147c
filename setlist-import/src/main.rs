//! setlist-import - concert data import service
//!
//! Subcommands:
//! - `serve`: queue workers plus the status HTTP/SSE surface
//! - `import <attraction-id>`: one import, waiting for the background phases
//! - `sync [artist-id]...`: staggered bulk sync (every artist when none given)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use setlist_common::config::ImportConfig;
use setlist_common::human_time::format_duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use setlist_import::adapters::Adapters;
use setlist_import::db::{self, Db};
use setlist_import::{AppState, ImportService, StartImportOptions};

/// Command-line arguments for setlist-import
#[derive(Parser, Debug)]
#[command(name = "setlist-import")]
#[command(about = "Background import of artists, shows and setlists")]
#[command(version)]
struct Args {
    /// Configuration file (overrides SETLIST_CONFIG and the default location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run queue workers and the status API
    Serve {
        /// Port to listen on (defaults to server.port)
        #[arg(short, long, env = "SETLIST_IMPORT_PORT")]
        port: Option<u16>,
    },
    /// Import one artist by ticketing attraction id
    Import {
        attraction_id: String,
        /// Run at admin priority
        #[arg(long)]
        admin: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "600")]
        wait_secs: u64,
    },
    /// Queue a staggered re-sync of existing artists
    Sync {
        artist_ids: Vec<Uuid>,
    },
}

/// How long in-flight jobs get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ImportConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting setlist-import {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database.path.display());

    let pool = db::init_database_pool(&config.database.path, config.database.max_connections)
        .await
        .context("Failed to open database")?;
    let db = Db::new(pool, config.database.max_lock_wait_ms);

    let adapters = Adapters::http(&config.credentials, &config.import.locale)
        .context("Failed to build upstream clients")?;
    let service = ImportService::new(config.clone(), adapters, db.clone())
        .await
        .context("Failed to start import service")?;

    let result = match args.command {
        Command::Serve { port } => serve(&service, &config, port).await,
        Command::Import {
            attraction_id,
            admin,
            wait_secs,
        } => import(&service, &attraction_id, admin, Duration::from_secs(wait_secs)).await,
        Command::Sync { artist_ids } => sync(&service, &artist_ids).await,
    };

    service.shutdown(SHUTDOWN_GRACE).await;
    db.close().await;
    result
}

async fn serve(service: &ImportService, config: &ImportConfig, port: Option<u16>) -> Result<()> {
    let app = setlist_import::build_router(AppState::new(service.clone()));

    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server stopped, draining queues");
    Ok(())
}

async fn import(
    service: &ImportService,
    attraction_id: &str,
    admin: bool,
    wait: Duration,
) -> Result<()> {
    let outcome = service
        .start_import(
            attraction_id,
            StartImportOptions {
                admin_import: admin,
                ..StartImportOptions::default()
            },
        )
        .await
        .with_context(|| format!("Import of {attraction_id} failed to start"))?;

    println!(
        "Artist {} ({}) ready in {}, job {}",
        outcome.slug,
        outcome.artist_id,
        format_duration(outcome.phase1_duration),
        outcome.job_id
    );

    let waited = tokio::select! {
        status = service.wait_for_terminal(outcome.job_id, wait) => Some(status?),
        _ = shutdown_signal() => None,
    };

    match waited.flatten() {
        Some(status) => {
            println!(
                "{}: {}% {}",
                status.stage,
                status.progress_percent,
                status.message
            );
            println!(
                "shows: {}  songs: {}  venues: {}",
                status.totals.shows.unwrap_or(0),
                status.totals.songs.unwrap_or(0),
                status.totals.venues.unwrap_or(0)
            );
            for (phase, millis) in &status.phase_timings {
                println!("  {phase}: {}", format_duration(Duration::from_millis(*millis)));
            }
            if let Some(error) = &status.error {
                anyhow::bail!("Import failed: {error}");
            }
            if !status.is_terminal() {
                warn!("Import still running after {}", format_duration(wait));
            }
        }
        None => warn!("No import status recorded for job {}", outcome.job_id),
    }
    Ok(())
}

async fn sync(service: &ImportService, artist_ids: &[Uuid]) -> Result<()> {
    let job_ids = if artist_ids.is_empty() {
        service.schedule_stale_sync().await?
    } else {
        service.schedule_bulk_sync(artist_ids).await?
    };
    println!("Queued {} sync jobs", job_ids.len());

    // Unstarted jobs stay in the store for the next `serve`
    info!("Workers running, press Ctrl+C to stop");
    shutdown_signal().await;
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
