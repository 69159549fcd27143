use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod collaborators;
mod config;
mod connector;
mod error;
mod handlers;
mod push;
mod registry;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::collaborators::{
    FileTargetRegistry, LogNotifier, Notifier, OperationalSettings, ReferenceDecryptor,
    SecretDecryptor, StaticSettings, TargetRegistry, WebhookNotifier, verify_credentials,
};
use crate::config::{FileConfig, ReconnectPolicy, RelayPaths, ServerConfig, load_config};
use crate::connector::{Connector, LinkConnector, LinkSettings};
use crate::push::PushSupervisor;
use crate::registry::ConnectionRegistry;

/// Adds a unique request ID to each incoming request span
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "tmux-relay")]
#[command(about = "Browser relay for local and remote tmux sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.tmux-relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve,

    /// Decrypt every stored target secret and exit
    CheckTargets,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub server_config: Arc<ServerConfig>,
    pub push: Option<Arc<PushSupervisor>>,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let paths = RelayPaths::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&paths.data_dir)
        .extract()
        .with_context(|| format!("Failed to load {}", paths.config_toml_path().display()))?;

    match cli.command {
        None | Some(Commands::Serve) => run_server(paths, file_config).await,
        Some(Commands::CheckTargets) => check_targets(&paths).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "tmux_relay=debug,tmux_link=debug,tmux_control=debug,tower_http=debug,info"
    } else {
        "tmux_relay=info,tmux_link=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn check_targets(paths: &RelayPaths) -> Result<()> {
    let targets = FileTargetRegistry::new(paths.targets_path());
    let checked = verify_credentials(targets.as_ref(), &ReferenceDecryptor).await?;
    println!("{} target secret(s) decrypted successfully", checked);
    Ok(())
}

async fn run_server(paths: RelayPaths, file_config: FileConfig) -> Result<()> {
    info!("Starting tmux relay");

    let server_config = Arc::new(ServerConfig::from_file(&file_config.server));
    let targets: Arc<dyn TargetRegistry> = FileTargetRegistry::new(paths.targets_path());
    let decryptor: Arc<dyn SecretDecryptor> = Arc::new(ReferenceDecryptor);

    // A secret that cannot be decrypted means the key is wrong; refuse to start.
    verify_credentials(targets.as_ref(), decryptor.as_ref())
        .await
        .context("Target credential check failed")?;

    let notifier: Arc<dyn Notifier> = match &file_config.notify.webhook_url {
        Some(url) => {
            info!(url = %url, "bell notifications go to webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(LogNotifier),
    };
    let settings = Arc::new(StaticSettings(OperationalSettings {
        push_enabled: file_config.push.enabled,
        site_url: file_config.push.site_url.clone(),
        reconnect: ReconnectPolicy::from_file(&file_config.push),
    }));

    let connector: Arc<dyn Connector> = LinkConnector::new(
        targets.clone(),
        decryptor,
        LinkSettings::from_server(&server_config),
    );
    let registry = ConnectionRegistry::new(connector.clone());

    let push = if file_config.push.enabled {
        let supervisor = PushSupervisor::new(connector, targets, notifier, settings);
        let added = supervisor.start().await?;
        info!("Push supervisor watching {} target(s)", added);

        let sync_every = file_config.push.target_sync_seconds;
        if sync_every > 0 {
            let supervisor = Arc::downgrade(&supervisor);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(sync_every));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(supervisor) = supervisor.upgrade() else {
                        break;
                    };
                    if let Err(e) = supervisor.sync_targets().await {
                        warn!("Failed to sync push targets: {:#}", e);
                    }
                }
            });
        }
        Some(supervisor)
    } else {
        info!("Push supervisor disabled");
        None
    };

    let app_state = AppState {
        registry,
        server_config: server_config.clone(),
        push: push.clone(),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/ws", get(handlers::relay_ws_handler))
        .route("/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(app_state);

    let addr = server_config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;
    info!("tmux relay listening on http://{}", actual_addr);
    info!("  GET /ws      - relay WebSocket");
    info!("  GET /health  - health check");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    if let Some(push) = push {
        push.stop_all().await;
    }

    info!("Shutdown complete");
    server_result
}
