use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gauge_observability::{
    emit_event, init_logging, LoggingOptions, ObservabilityEvent, ProcessKind,
};
use gauge_server::{serve, AppState, AuthMode, ServerConfig};
use gauge_store::Store;

#[derive(Parser, Debug)]
#[command(name = "gauge-platform")]
#[command(about = "Gauge evaluation platform service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", env = "GAUGE_HOSTNAME", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, env = "GAUGE_PORT", default_value_t = 8000)]
        port: u16,
        #[arg(long, env = "GAUGE_DB_PATH", default_value = "gauge.db")]
        db_path: PathBuf,
        /// Public base URL used in live run links.
        #[arg(long, env = "GAUGE_BASE_URL")]
        base_url: Option<String>,
        /// `proxy_headers` (default) or `none` for local development.
        #[arg(long, env = "GAUGE_AUTH_MODE", default_value = "proxy_headers")]
        auth_mode: String,
        /// Secret enabling first-user bootstrap; empty disables it.
        #[arg(long, env = "GAUGE_ADMIN_BOOTSTRAP_TOKEN", default_value = "")]
        admin_bootstrap_token: String,
        #[arg(long, env = "GAUGE_LOGS_DIR", default_value = "logs")]
        logs_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            db_path,
            base_url,
            auth_mode,
            admin_bootstrap_token,
            logs_dir,
        } => {
            let logging =
                init_logging(ProcessKind::Platform, &logs_dir, &LoggingOptions::default())?;
            info!(
                prefix = %logging.file_prefix,
                logs_dir = %logs_dir.display(),
                "logging initialized"
            );

            let auth_mode = AuthMode::parse(&auth_mode)
                .with_context(|| format!("unknown auth mode {auth_mode:?}"))?;
            if auth_mode == AuthMode::None {
                warn!("auth mode is 'none': every request sees every run; never deploy this");
            }

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let config = ServerConfig {
                base_url: base_url.unwrap_or_else(|| format!("http://{addr}")),
                auth_mode,
                admin_bootstrap_token,
            };

            let store = Store::open(&db_path)
                .await
                .with_context(|| format!("opening database at {}", db_path.display()))?;
            info!(db = %db_path.display(), %addr, "starting gauge platform");
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Platform,
                ObservabilityEvent {
                    event: "platform.start",
                    component: "platform.main",
                    run_id: None,
                    item_id: None,
                    metric: None,
                    status: Some("start"),
                    error_code: None,
                    detail: None,
                },
            );

            serve(addr, AppState::new(store, config)).await?;
        }
    }

    Ok(())
}
