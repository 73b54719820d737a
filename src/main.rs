//! chrona - a durable timer dispatcher.
//!
//! Usage:
//!   chrona run                      Run the dispatcher until Ctrl+C
//!   chrona schedule <event> <in>    Persist a timer due after a duration
//!   chrona pending                  List pending timers
//!   chrona validate                 Validate the configuration file

use chrona::{
    Dispatcher, DispatcherConfig, EventSink, InMemoryStore, StorageConfig, TimerPayload,
    TimerRecord, TimerStore, UpsertOutcome, YamlLoader, natural_delta, parse_duration,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// chrona - a durable timer dispatcher
#[derive(Parser)]
#[command(name = "chrona")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (default: built-in defaults)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher until interrupted
    Run,

    /// Persist a timer that fires after a duration
    Schedule {
        /// Event name; handlers listen on "<event>_timer_complete"
        #[arg(value_name = "EVENT")]
        event: String,

        /// Delay such as "90s", "1h30m" or "2 days"
        #[arg(value_name = "IN")]
        delay: String,

        /// Positional argument as JSON (repeatable)
        #[arg(long = "arg", value_name = "JSON")]
        args: Vec<String>,

        /// Named argument as NAME=JSON (repeatable)
        #[arg(long = "kwarg", value_name = "NAME=JSON")]
        kwargs: Vec<String>,

        /// De-duplication key; an existing timer only moves earlier
        #[arg(long)]
        key: Option<String>,
    },

    /// List pending timers, earliest first
    Pending {
        /// Maximum number of timers to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Validate the configuration without running
    Validate,
}

/// Sink that logs every fired timer.
struct LoggingSink;

#[async_trait::async_trait]
impl EventSink for LoggingSink {
    async fn dispatch(&self, timer: &TimerRecord) {
        let payload = timer.payload.to_json().unwrap_or_else(|e| e.to_string());
        info!(
            timer_id = ?timer.id,
            handler = %timer.handler_key(),
            payload = %payload,
            "Timer fired"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => YamlLoader::load_config(path)?,
        None => DispatcherConfig::default(),
    };

    // Initialize logging
    let default_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))?,
        )
        .init();

    match cli.command {
        Commands::Run => match &config.storage {
            StorageConfig::Memory => {
                warn!("Using in-memory storage; timers are lost on exit");
                run_dispatcher(&config, Arc::new(InMemoryStore::new())).await?;
            }
            StorageConfig::Sqlite { path } => {
                let store = Arc::new(open_sqlite(path).await?);
                run_dispatcher(&config, Arc::clone(&store)).await?;
                close_sqlite(&store).await;
            }
        },
        Commands::Schedule {
            event,
            delay,
            args,
            kwargs,
            key,
        } => {
            let timer = build_timer(event, &delay, &args, &kwargs, key)?;
            match &config.storage {
                StorageConfig::Memory => {
                    return Err("scheduling from the command line needs sqlite storage".into());
                }
                StorageConfig::Sqlite { path } => {
                    let store = open_sqlite(path).await?;
                    let result = schedule_timer(&store, &timer).await;
                    close_sqlite(&store).await;
                    result?;
                }
            }
        }
        Commands::Pending { limit } => match &config.storage {
            StorageConfig::Memory => {
                println!("In-memory storage has no pending timers outside a running dispatcher");
            }
            StorageConfig::Sqlite { path } => {
                let store = open_sqlite(path).await?;
                let result = list_pending(&store, limit).await;
                close_sqlite(&store).await;
                result?;
            }
        },
        Commands::Validate => {
            let source = cli
                .config
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            info!("Configuration from {} is valid", source);
            info!("  fast path threshold: {:?}", config.fast_path_threshold());
            info!("  restart delay: {:?}", config.restart_delay());
            info!("  storage: {:?}", config.storage);
        }
    }

    Ok(())
}

/// Run the dispatcher until Ctrl+C or a fatal error.
async fn run_dispatcher<S: TimerStore + 'static>(
    config: &DispatcherConfig,
    store: Arc<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::from_config(config, store, Arc::new(LoggingSink));

    info!(
        "Starting dispatcher (fast path: {:?}, restart delay: {:?})...",
        config.fast_path_threshold(),
        config.restart_delay()
    );
    info!("Press Ctrl+C to stop");

    let (handle, mut task) = dispatcher.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown();
            task.await??;
        }
        result = &mut task => {
            if let Err(e) = result? {
                error!(error = %e, "Dispatcher stopped");
                return Err(e.into());
            }
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Build a timer from command line arguments.
fn build_timer(
    event: String,
    delay: &str,
    args: &[String],
    kwargs: &[String],
    key: Option<String>,
) -> Result<TimerRecord, Box<dyn std::error::Error>> {
    let delay = parse_duration(delay)?;
    let now = chrono::Utc::now();
    let expires = now + chrono::Duration::from_std(delay)?;

    let mut payload = TimerPayload::new();
    for arg in args {
        payload = payload.with_arg(parse_json_arg(arg))?;
    }
    for kwarg in kwargs {
        let (name, value) = kwarg
            .split_once('=')
            .ok_or_else(|| format!("named argument must be NAME=JSON, got '{}'", kwarg))?;
        payload = payload.with_kwarg(name, parse_json_arg(value))?;
    }

    let timer = TimerRecord::new(event, now, expires, payload);
    Ok(match key {
        Some(key) => timer.with_key(key),
        None => timer,
    })
}

/// Parse a value as JSON, falling back to a plain string.
fn parse_json_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Persist a timer; a running dispatcher picks it up on its next re-query.
async fn schedule_timer<S: TimerStore>(
    store: &S,
    timer: &TimerRecord,
) -> Result<(), Box<dyn std::error::Error>> {
    if timer.key.is_some() {
        match store.create_or_update(timer).await? {
            UpsertOutcome::Created(id) => println!("Scheduled timer #{}", id),
            UpsertOutcome::Replaced { id, previous } => {
                println!("Moved timer #{} earlier as #{}", previous, id)
            }
            UpsertOutcome::Kept(existing) => {
                println!("Kept existing {}", existing)
            }
        }
    } else {
        let id = store.create(timer).await?;
        println!("Scheduled timer #{}", id);
    }
    println!(
        "  fires {} ({})",
        natural_delta(timer.expires, chrono::Utc::now()),
        timer.expires.to_rfc3339()
    );
    Ok(())
}

/// Print pending timers.
async fn list_pending<S: TimerStore>(
    store: &S,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let timers = store.list_pending(limit).await?;
    if timers.is_empty() {
        println!("No pending timers");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for timer in &timers {
        let id = timer
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("#{} {}", id, timer.event);
        println!(
            "  Fires: {} ({})",
            natural_delta(timer.expires, now),
            timer.expires.to_rfc3339()
        );
        println!("  Created: {}", timer.human_delta(now));
        if let Some(key) = &timer.key {
            println!("  Key: {}", key);
        }
        if !timer.payload.args.is_empty() || !timer.payload.kwargs.is_empty() {
            println!("  Payload: {}", timer.payload.to_json()?);
        }
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &str) -> Result<chrona::SqliteStore, Box<dyn std::error::Error>> {
    info!("Opening timer database: {}", path);
    Ok(chrona::SqliteStore::new(path).await?)
}

#[cfg(feature = "sqlite")]
async fn close_sqlite(store: &chrona::SqliteStore) {
    store.close().await;
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_path: &str) -> Result<InMemoryStore, Box<dyn std::error::Error>> {
    Err("chrona was built without the sqlite feature".into())
}

#[cfg(not(feature = "sqlite"))]
async fn close_sqlite(_store: &InMemoryStore) {}
