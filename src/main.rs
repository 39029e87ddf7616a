//! Academy Storage Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! academy-storage
//!
//! # Start with custom config
//! academy-storage --config /path/to/config.toml
//!
//! # Custom port and storage directory
//! academy-storage --http-port 9000 --storage-dir /data/academy
//!
//! # Let unreadable unlock criteria open content instead of locking it
//! academy-storage --criteria-policy open
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use academy_storage::services::events::spawn_logging_listener;
use academy_storage::{AcademyDb, Config, CriteriaPolicy, HttpServer, Services};

#[derive(Parser, Debug)]
#[command(name = "academy-storage")]
#[command(about = "Course catalog, category hierarchy and learner progress service")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ACADEMY_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "ACADEMY_HTTP_PORT")]
    http_port: Option<u16>,

    /// Treatment of unreadable unlock criteria: open or closed
    #[arg(long, env = "ACADEMY_CRITERIA_POLICY")]
    criteria_policy: Option<CriteriaPolicy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("academy_storage=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(policy) = args.criteria_policy {
        config.criteria_policy = policy;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        criteria_policy = ?config.criteria_policy,
        "Starting academy-storage"
    );

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(AcademyDb::open(&config.database_path())?);
    let services = Arc::new(Services::new(db.clone(), &config));
    let listener = spawn_logging_listener(services.events.clone());

    let http_addr: SocketAddr = format!("{}:{}", config.bind_host, config.http_port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind_host, config.http_port))?;
    let http_server = Arc::new(HttpServer::new(services, http_addr, config.default_page_size));

    info!("HTTP API available at http://{}", http_addr);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    listener.abort();

    if let Ok(stats) = db.stats() {
        info!(
            categories = stats.category_count,
            courses = stats.course_count,
            lessons = stats.lesson_count,
            "Final storage stats"
        );
    }

    Ok(())
}
