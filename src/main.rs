use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mailnotifyd::{
    config::{self, DaemonConfig},
    fetch::imap::ImapFetcher,
    notify::Dispatcher,
    rest,
    storage::Storage,
    sync::{scheduler::SyncScheduler, SyncEngine},
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "mailnotifyd",
    about = "Mailbox watcher — polls IMAP accounts and forwards new mail to notification channels",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "MAILNOTIFYD_PORT")]
    port: Option<u16>,

    /// Data directory for config.toml and the SQLite database
    #[arg(long, env = "MAILNOTIFYD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MAILNOTIFYD_LOG")]
    log: Option<String>,

    /// Bind address for the REST server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "MAILNOTIFYD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "MAILNOTIFYD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    ///
    /// Runs the scheduled sync loop and the REST API in the foreground.
    Serve,
    /// Run one sync pass and exit, printing the report as JSON.
    ///
    /// Examples:
    ///   mailnotifyd run-once
    ///   mailnotifyd run-once --account me@example.com
    RunOnce {
        /// Sync only this mailbox account instead of all of them
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let log_format =
        std::env::var("MAILNOTIFYD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    let data_dir = args.data_dir.unwrap_or_else(config::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("could not create data directory {}", data_dir.display()))?;

    let mut config = DaemonConfig::load(&data_dir)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind_address {
        config.server.bind_address = bind;
    }
    let config = Arc::new(config);

    let storage = Arc::new(Storage::new(&data_dir).await?);
    let fetcher = Arc::new(ImapFetcher::new(Arc::clone(&config)));
    let notifier = Arc::new(Dispatcher::new(&config)?);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&config),
        Arc::clone(&storage),
        fetcher,
        notifier,
    ));

    match args.command {
        Some(Command::RunOnce { account }) => run_once(&engine, account.as_deref()).await,
        None | Some(Command::Serve) => serve(config, storage, engine).await,
    }
}

async fn serve(
    config: Arc<DaemonConfig>,
    storage: Arc<Storage>,
    engine: Arc<SyncEngine>,
) -> Result<()> {
    if config.server.auth_token.is_empty() {
        warn!("no auth token configured — REST API is open to anyone who can reach it");
    }

    let interval = Duration::from_secs(config.sync.interval_minutes * 60);
    let scheduler = SyncScheduler::spawn(Arc::clone(&engine), interval);
    info!(
        interval_minutes = config.sync.interval_minutes,
        "sync scheduler started"
    );

    let ctx = Arc::new(AppContext {
        config,
        storage,
        sync: engine,
        started_at: Instant::now(),
    });

    // Blocks until ctrl-c; the scheduler keeps running alongside.
    rest::start_rest_server(ctx).await?;

    info!("shutting down, waiting for in-flight sync pass");
    scheduler.shutdown().await;
    Ok(())
}

async fn run_once(engine: &Arc<SyncEngine>, account: Option<&str>) -> Result<()> {
    let output = match account {
        Some(account) => {
            let result = engine
                .run_account(account)
                .await?
                .with_context(|| format!("no mailbox configured for '{account}'"))?;
            serde_json::to_string_pretty(&result)?
        }
        None => {
            let report = engine.run_cycle().await;
            serde_json::to_string_pretty(&report)?
        }
    };
    println!("{output}");
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("mailnotifyd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
