mod app;
mod auth;
mod builtins;
mod codec;
mod config;
mod cron;
mod db;
mod dispatch;
mod envfile;
mod evaluator;
mod logs;
mod tls;

#[cfg(test)]
mod dispatch_tests;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ServerConfig, UpArgs};
use crate::db::Database;
use crate::evaluator::Evaluator;
use crate::logs::AccessLog;

#[derive(Debug, Parser)]
#[command(name = "smallweb", version, about = "Multi-tenant web server for evaluator-backed apps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the server
    #[command(alias = "serve")]
    Up(UpArgs),

    /// Manage API tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Debug, Subcommand)]
enum TokenAction {
    /// Create a token and print the one-time credential
    Create {
        /// Free-form description of what the token is for
        #[arg(long)]
        description: Option<String>,
    },
}

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Database,
    pub evaluator: Evaluator,
    pub access_log: AccessLog,
    pub http: reqwest::Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smallweb=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Up(args) => up(args).await,
        Command::Token {
            action: TokenAction::Create { description },
        } => create_token(description.as_deref()).await,
    }
}

/// Provision a token against the shared store and print the one-time
/// credential.
async fn create_token(description: Option<&str>) -> Result<()> {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("smallweb");
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let db = Database::open(&data_dir.join("smallweb.db")).await?;
    db.migrate().await?;

    let credential = auth::tokens::create(&db, description).await?;
    println!("{credential}");
    Ok(())
}

async fn up(args: UpArgs) -> Result<()> {
    info!("Starting smallweb v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_args(args)?;
    info!(
        root = %config.root_dir.display(),
        domain = %config.domain,
        addr = %config.addr,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let db = Database::open(&config.data_dir.join("smallweb.db")).await?;
    db.migrate().await?;
    info!("Session store initialized");

    let evaluator = Evaluator::materialize(&config).await?;
    info!("Evaluator support file materialized");

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let state = Arc::new(AppState {
        access_log: AccessLog::new(&config.root_dir),
        config: config.clone(),
        db,
        evaluator,
        http,
    });

    // Minute-aligned cron driver
    cron::spawn(state.clone());

    // Spawn hourly expired-session sweep
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                if let Ok(n) = auth::sessions::cleanup_expired(&db).await {
                    if n > 0 {
                        info!(deleted = n, "Cleaned up expired sessions");
                    }
                }
            }
        });
    }

    let app = build_router(state);

    if config.tls_enabled() {
        info!("Starting HTTPS server on {}", config.addr);
        tls::serve_tls(app, config.addr, &config).await?;
    } else {
        info!("Starting HTTP server on {}", config.addr);
        let listener = tokio::net::TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;
        axum::serve(listener, app).await.context("HTTP server error")?;
    }

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch::handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
}
