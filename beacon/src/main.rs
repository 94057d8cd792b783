//! beacon - operator CLI for the Beacon event tracker
//!
//! This tool provides commands for:
//! - Checking tracker configuration and offline cache status
//! - Sending a single event through the full pipeline
//! - Delivering events left in the offline cache
//! - Computing batch signatures when debugging endpoint verification
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)
//! - Offline cache: $XDG_DATA_HOME/beacon/offline.db (~/.local/share/beacon/offline.db)
//! - Logs: $XDG_STATE_HOME/beacon/ (~/.local/state/beacon/)

use std::io::Read;

use anyhow::{bail, Context, Result};
use beacon_core::offline::OfflineCache;
use beacon_core::signer::create_signature;
use beacon_core::{storage, Config, Event, Tracker};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Inspect and drive the Beacon event tracker")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show tracker configuration and offline cache status
    Status,

    /// Track one event, then flush and shut down
    Track {
        /// Event as JSON, e.g. '{"type":"page_viewed","data":{"path":"/"}}'
        event: String,

        /// Caller-measured latency in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
    },

    /// Deliver events waiting in the offline cache
    Flush,

    /// Inspect or clear the offline cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the HMAC-SHA256 signature of stdin
    Sign {
        /// Secret to sign with (default: tracker.api_key)
        #[arg(short, long)]
        key: Option<String>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print cached events as JSON
    Show,
    /// Remove every cached event
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(
            beacon_core::logging::init(&config.logging, config.tracker.environment)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config).await,
        Command::Track { event, latency_ms } => cmd_track(&config, &event, latency_ms).await,
        Command::Flush => cmd_flush(&config).await,
        Command::Cache { action } => cmd_cache(&config, action).await,
        Command::Sign { key } => cmd_sign(&config, key),
    }
}

async fn cmd_status(config: &Config) -> Result<()> {
    let tracker = &config.tracker;

    println!("Beacon Tracker Configuration");
    println!("============================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Project:         {}", or_unset(&tracker.project_id));
    println!("API key:         {}", mask_key(&tracker.api_key));
    println!("Environment:     {}", tracker.environment.as_str());
    println!("Endpoint:        {}", tracker.endpoint);
    println!("Batch size:      {}", tracker.batch_size);
    println!("Flush interval:  {}ms", tracker.flush_interval_ms);
    println!("Max retries:     {}", tracker.max_retries);
    match config.connectivity.probe_interval() {
        Some(interval) => println!("Probe interval:  {}s", interval.as_secs()),
        None => println!("Probe interval:  disabled"),
    }

    if let Err(e) = tracker.validate() {
        println!();
        println!("Configuration is incomplete: {}", e);
        println!("Set it in {} or via $BEACON_API_KEY.", Config::config_path().display());
    }

    println!();
    println!("Offline Cache");
    println!("-------------");
    let cache = open_cache(config)?;
    let events = cache.load().await.context("failed to read offline cache")?;
    println!("Backend:         {}", cache.backend());
    println!("Cached events:   {}", events.len());

    Ok(())
}

async fn cmd_track(config: &Config, raw: &str, latency_ms: Option<u64>) -> Result<()> {
    let event: Event = serde_json::from_str(raw).context("invalid event JSON")?;
    let kind = event.kind();

    let tracker = Tracker::from_config(config).context("failed to start tracker")?;
    match latency_ms {
        Some(ms) => tracker.track_with_latency(event, std::time::Duration::from_millis(ms)),
        None => tracker.track(event),
    }
    tracker.destroy().await;

    println!("Tracked {} in session {}", kind, tracker.session_id());
    report_cache(tracker.offline_cache()).await
}

async fn cmd_flush(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    let before = cache.load().await.context("failed to read offline cache")?.len();
    if before == 0 {
        println!("Offline cache is empty, nothing to flush");
        return Ok(());
    }
    drop(cache);

    let tracker = Tracker::from_config(config).context("failed to start tracker")?;
    tracker.destroy().await;

    let after = tracker
        .offline_cache()
        .load()
        .await
        .context("failed to read offline cache")?
        .len();
    println!(
        "Delivered {} of {} cached event(s)",
        before.saturating_sub(after),
        before
    );
    report_cache(tracker.offline_cache()).await
}

async fn cmd_cache(config: &Config, action: CacheAction) -> Result<()> {
    let cache = open_cache(config)?;
    match action {
        CacheAction::Show => {
            let events = cache.load().await.context("failed to read offline cache")?;
            if events.is_empty() {
                println!("Offline cache is empty");
                return Ok(());
            }
            println!("{} cached event(s) in {} storage", events.len(), cache.backend());
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        CacheAction::Clear => {
            cache.clear().await.context("failed to clear offline cache")?;
            println!("Offline cache cleared");
        }
    }
    Ok(())
}

fn cmd_sign(config: &Config, key: Option<String>) -> Result<()> {
    let key = key.unwrap_or_else(|| config.tracker.api_key.clone());
    if key.is_empty() {
        bail!("no signing key: pass --key or set tracker.api_key");
    }

    let mut payload = String::new();
    std::io::stdin()
        .read_to_string(&mut payload)
        .context("failed to read stdin")?;

    println!("{}", create_signature(&payload, &key));
    Ok(())
}

fn open_cache(config: &Config) -> Result<OfflineCache> {
    let storage = storage::open(&config.storage).context("failed to open offline cache storage")?;
    Ok(OfflineCache::new(storage))
}

async fn report_cache(cache: &OfflineCache) -> Result<()> {
    let cached = cache.load().await.context("failed to read offline cache")?.len();
    if cached > 0 {
        println!("{} event(s) waiting in the offline cache", cached);
    }
    Ok(())
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}

fn mask_key(key: &str) -> String {
    match key.char_indices().nth(4) {
        _ if key.is_empty() => "(not set)".to_string(),
        Some((idx, _)) if key.len() > 8 => format!("{}****", &key[..idx]),
        _ => "****".to_string(),
    }
}
