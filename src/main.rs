use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use parley_server::ServerConfig;
use parley_store::{Database, SqliteChatStore};
use parley_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};

/// Presence and message delivery server.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Cli {
    /// JSON config file, merged over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Print persisted warn+ logs as JSON lines, newest first.
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct LogsArgs {
    /// Minimum level, e.g. `error`.
    #[arg(long)]
    level: Option<Level>,
    /// Module path prefix.
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    connection: Option<String>,
    #[arg(long)]
    message: Option<String>,
    /// RFC 3339 lower bound.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
}

impl From<LogsArgs> for LogQuery {
    fn from(args: LogsArgs) -> Self {
        Self {
            min_level: args.level,
            target: args.target,
            user_id: args.user,
            connection_id: args.connection,
            message_id: args.message,
            since: args.since,
            limit: Some(args.limit),
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
    }
}

/// The log database lives next to the chat database.
fn log_db_path(config: &ServerConfig) -> PathBuf {
    config
        .db_path
        .parent()
        .map(|dir| dir.join("logs.db"))
        .unwrap_or_else(|| parley_server::config::parley_home().join("logs.db"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    let mut config =
        parley_server::load_config(cli.config.as_deref()).context("failed to load config")?;
    cli.apply(&mut config);

    match cli.command.take() {
        Some(Command::Logs(args)) => print_logs(&config, args.into()),
        Some(Command::Serve) | None => serve(config, cli.verbose).await,
    }
}

fn print_logs(config: &ServerConfig, query: LogQuery) -> anyhow::Result<()> {
    let path = log_db_path(config);
    let sink = SqliteLogSink::new(&path)
        .with_context(|| format!("failed to open log database at {}", path.display()))?;
    for record in sink.query(&query).context("log query failed")? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn serve(config: ServerConfig, verbose: bool) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: if verbose { Level::DEBUG } else { Level::INFO },
        log_db_path: log_db_path(&config),
        ..Default::default()
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parley");

    let db = Database::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let store = Arc::new(SqliteChatStore::new(db));

    let handle = parley_server::start(config, store)
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.addr, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
