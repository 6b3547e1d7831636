//! admitgate - admission control for outbound operations
//!
//! CLI entry point: drives simulated or HTTP operations through the scheduler
//! and inspects cross-context entries in the shared store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use admitgate::cli::{Cli, Command, SchedulerArgs, SimulateArgs};
use admitgate::config::Config;
use admitgate::events::{EventLogger, SchedulerEvent, Subscription, spawn_event_logger};
use admitgate::scheduler::{Scheduler, SchedulerStats, read_entries};
use admitgate::workload;
use sharedstore::{FileStore, SharedStore};

fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Some(tracing::Level::TRACE),
        "DEBUG" => Some(tracing::Level::DEBUG),
        "INFO" => Some(tracing::Level::INFO),
        "WARN" | "WARNING" => Some(tracing::Level::WARN),
        "ERROR" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("admitgate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => parse_level(s).unwrap_or_else(|| {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }),
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("admitgate.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store_path = cli.store.clone().unwrap_or_else(|| config.store.resolved_path());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate(args) => cmd_simulate(&config, &store_path, args).await,
        Command::Fetch {
            urls,
            lane_per_host,
            scheduler,
        } => cmd_fetch(&config, &store_path, urls, lane_per_host, &scheduler).await,
        Command::Contexts => cmd_contexts(&config, &store_path),
    }
}

/// File configuration merged with CLI overrides; opens the store only when needed
fn build_scheduler(config: &Config, store_path: &Path, args: &SchedulerArgs, paused: bool) -> Result<Scheduler> {
    let mut options = args.to_options();
    if paused {
        options.active = Some(false);
    }
    let scheduler_config = config.scheduler.merge(&options);

    let store: Option<Arc<dyn SharedStore>> = if scheduler_config.across_contexts {
        let store = FileStore::open(store_path).context(format!("Failed to open shared store {}", store_path.display()))?;
        Some(Arc::new(store))
    } else {
        None
    };

    Scheduler::new(scheduler_config, store).context("Failed to start scheduler")
}

fn lane_suffix(lane: &Option<String>) -> String {
    lane.as_ref().map(|l| format!(" [{}]", l)).unwrap_or_default()
}

fn print_event(event: &SchedulerEvent, at: Duration) {
    let ts = format!("{:>8.3}s", at.as_secs_f64()).dimmed();
    match event {
        SchedulerEvent::Sent { request_id, lane } => {
            println!("{} {:<8} #{}{}", ts, "sent".cyan(), request_id, lane_suffix(lane).magenta());
        }
        SchedulerEvent::Received {
            request_id,
            lane,
            success,
        } => {
            let outcome = if *success { "ok".green() } else { "failed".red() };
            println!(
                "{} {:<8} #{}{} {}",
                ts,
                "received".blue(),
                request_id,
                lane_suffix(lane).magenta(),
                outcome
            );
        }
        SchedulerEvent::Error {
            request_id, message, ..
        } => {
            println!("{} {:<8} #{} {}", ts, "error".red().bold(), request_id, message);
        }
        SchedulerEvent::Drained => {
            println!("{} {}", ts, "drained".yellow());
        }
    }
}

fn print_stats(stats: &SchedulerStats) {
    println!();
    println!("{}", "Stats".bold());
    println!("  enqueued:      {}", stats.total_enqueued);
    println!("  dispatched:    {}", stats.total_dispatched);
    println!("  completed:     {}", stats.total_completed);
    println!("  failed:        {}", stats.total_failed);
    println!("  rate limited:  {}", stats.total_rate_limited);
    println!("  peak queued:   {}", stats.peak_queue_depth);
    println!("  peak inflight: {}", stats.peak_concurrent);
    if stats.total_dispatched > 0 {
        println!(
            "  avg wait:      {}ms",
            stats.total_wait_time_ms / stats.total_dispatched
        );
    }
}

/// Print events as they arrive until `work` resolves, then flush the rest
async fn watch<F: std::future::Future>(mut events: Subscription, started: Instant, work: F) -> F::Output {
    tokio::pin!(work);
    let mut open = true;
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            event = events.recv(), if open => match event {
                Ok(event) => print_event(&event, started.elapsed()),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Event printer lagged"),
                Err(RecvError::Closed) => open = false,
            },
        }
    };
    for event in events.drain() {
        print_event(&event, started.elapsed());
    }
    output
}

async fn cmd_simulate(config: &Config, store_path: &Path, args: SimulateArgs) -> Result<()> {
    debug!(?args, "cmd_simulate: called");
    let scheduler = build_scheduler(config, store_path, &args.scheduler, args.paused.is_some())?;

    let event_log = match &args.event_log {
        Some(Some(path)) => Some(path.clone()),
        Some(None) => Some(EventLogger::default_path()?),
        None => None,
    };
    let logger = match &event_log {
        Some(path) => Some(spawn_event_logger(scheduler.events(), path).context("Failed to start event log")?),
        None => None,
    };

    let settings = scheduler.config();
    println!(
        "Simulating {} operations: rate {}/{}ms, concurrent {}{}",
        args.requests.to_string().bold(),
        settings.rate,
        settings.rate_per_ms,
        settings.concurrent,
        if settings.across_contexts { ", across contexts" } else { "" }
    );

    let events = scheduler.subscribe();
    let started = Instant::now();
    let base = Duration::from_millis(args.duration_ms);

    let pending: Vec<_> = (1..=args.requests)
        .map(|index| {
            scheduler
                .intercept(workload::simulate(index, base, args.fail_every))
                .with_lane(workload::lane_for_index(index, &args.lanes))
                .send()
        })
        .collect();

    if let Some(delay) = args.paused {
        let resumer = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            println!("{} {}", format!("{:>8.3}s", started.elapsed().as_secs_f64()).dimmed(), "resumed".bold());
            resumer.set_active(true);
        });
    }

    let results = watch(events, started, join_all(pending)).await;

    let failed = results.iter().filter(|r| matches!(r, Ok(Err(_)))).count();
    let abandoned = results.iter().filter(|r| r.is_err()).count();
    print_stats(&scheduler.stats());
    println!(
        "\n{} {} succeeded, {} failed, {} abandoned in {:.3}s",
        "✓".green(),
        results.len() - failed - abandoned,
        failed,
        abandoned,
        started.elapsed().as_secs_f64()
    );

    scheduler.close();
    drop(scheduler);

    if let (Some(handle), Some(path)) = (logger, event_log) {
        let written = handle.await.context("Event log task failed")?;
        println!("{} {} events written to {}", "✓".green(), written, path.display());
    }
    Ok(())
}

async fn cmd_fetch(
    config: &Config,
    store_path: &Path,
    urls: Vec<String>,
    lane_per_host: bool,
    args: &SchedulerArgs,
) -> Result<()> {
    debug!(count = urls.len(), lane_per_host, "cmd_fetch: called");
    let scheduler = build_scheduler(config, store_path, args, false)?;
    let client = reqwest::Client::builder()
        .user_agent(concat!("admitgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let events = scheduler.subscribe();
    let started = Instant::now();

    let pending: Vec<_> = urls
        .iter()
        .map(|url| {
            scheduler
                .intercept(workload::fetch(client.clone(), url.clone()))
                .with_lane(workload::lane_for_url(url, lane_per_host))
                .send()
        })
        .collect();

    let results = watch(events, started, join_all(pending)).await;

    println!();
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(Ok(fetched)) => println!(
                "{} {} {} ({} bytes, {}ms)",
                "✓".green(),
                fetched.status.to_string().green(),
                fetched.url,
                fetched.bytes,
                fetched.took.as_millis()
            ),
            Ok(Err(e)) => println!("{} {}", "✗".red(), e),
            Err(e) => println!("{} {}: {}", "✗".red(), url, e),
        }
    }
    print_stats(&scheduler.stats());

    scheduler.close();
    Ok(())
}

fn cmd_contexts(config: &Config, store_path: &Path) -> Result<()> {
    debug!(store = %store_path.display(), "cmd_contexts: called");
    let store = FileStore::open(store_path).context(format!("Failed to open shared store {}", store_path.display()))?;
    let prefix = &config.scheduler.context_id_prefix;
    let expire = config.scheduler.context_expire();
    let now = chrono::Utc::now().timestamp_millis();

    let entries = read_entries(&store, prefix);
    if entries.is_empty() {
        println!("No context entries under '{}' in {}", prefix, store_path.display());
        return Ok(());
    }

    for (key, entry) in entries {
        match entry {
            Some(entry) => {
                let age = Duration::from_millis(now.saturating_sub(entry.last_action_at).max(0) as u64);
                let state = if entry.is_stale(now, expire) {
                    "stale".red()
                } else {
                    "live".green()
                };
                println!(
                    "{:<36} {:>4} in flight  {:>8.1}s ago  {}",
                    key.cyan(),
                    entry.current_count,
                    age.as_secs_f64(),
                    state
                );
            }
            None => println!("{:<36} {}", key.cyan(), "malformed".yellow()),
        }
    }
    Ok(())
}
