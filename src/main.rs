//! `tabsync` command line.
//!
//! Runs participants against the configured store: an in-process simulation,
//! a long-running election participant, a one-off lock holder, and store
//! inspection/cleanup. Use the `sqlite` backend to coordinate between
//! terminals.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabsync::clock::SystemClock;
use tabsync::config::Config;
use tabsync::retry::RetryPolicy;
use tabsync::storage::{create_store, RetentionPolicy, StorageAccessor};
use tabsync::sync::{BroadcastHub, KeySpace, StoreSnapshot, TabCoordinator};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Master election and advisory locks over a shared key-value store.
#[derive(Parser, Debug)]
#[command(name = "tabsync", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Race several in-process participants for mastership and a lock
    Simulate {
        #[arg(long, default_value_t = 4)]
        tabs: usize,
        #[arg(long, default_value_t = 3)]
        rounds: usize,
        #[arg(long, default_value = "agency_selection")]
        lock: String,
    },
    /// Join the election and heartbeat while master
    Elect {
        /// Stop after this many seconds (runs until Ctrl-C when omitted)
        #[arg(long)]
        hold_secs: Option<u64>,
    },
    /// Acquire a named lock, hold it, then release it
    Lock {
        name: String,
        /// Lock lifetime (defaults to mutex.default_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, default_value_t = 1_000)]
        hold_ms: u64,
        /// Attempts before giving up while the lock is held elsewhere
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
    /// Print the master record and all lock records
    Inspect,
    /// Run the storage cleanup pass
    Cleanup,
    /// Show the effective config or its JSON schema
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate { tabs, rounds, lock } => simulate(&config, tabs, rounds, &lock).await,
        Commands::Elect { hold_secs } => elect(&config, hold_secs).await,
        Commands::Lock {
            name,
            timeout_ms,
            hold_ms,
            attempts,
        } => lock(&config, &name, timeout_ms, hold_ms, attempts).await,
        Commands::Inspect => {
            let accessor = accessor(&config)?;
            let snapshot = StoreSnapshot::read(&accessor, &KeySpace::new(config.app_prefix.clone()));
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::Cleanup => {
            let removed = accessor(&config)?.cleanup();
            println!("Removed {removed} expired entries");
            Ok(())
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
                ConfigAction::Schema => {
                    let schema = schemars::schema_for!(Config);
                    println!("{}", serde_json::to_string_pretty(&schema)?);
                }
            }
            Ok(())
        }
    }
}

fn accessor(config: &Config) -> Result<StorageAccessor> {
    Ok(StorageAccessor::new(
        create_store(config)?,
        Arc::new(SystemClock),
        RetentionPolicy::from_config(config),
        config.storage.atomic_writes,
    ))
}

async fn simulate(config: &Config, tabs: usize, rounds: usize, lock: &str) -> Result<()> {
    if tabs == 0 {
        bail!("--tabs must be at least 1");
    }
    let store = create_store(config)?;
    let hub = BroadcastHub::new();
    let participants: Vec<Arc<TabCoordinator>> = (0..tabs)
        .map(|_| Arc::new(TabCoordinator::new(config, store.clone(), &hub)))
        .collect();
    let timeout = participants[0].default_lock_timeout();

    for round in 1..=rounds {
        let mut elections = JoinSet::new();
        for tab in &participants {
            let tab = Arc::clone(tab);
            elections.spawn(async move { tab.elect_master().await });
        }
        while elections.join_next().await.is_some() {}

        for tab in &participants {
            tab.process_pending_messages();
            tab.election().heartbeat();
        }

        let mut acquired = 0;
        for tab in &participants {
            if tab.acquire_mutex(lock, timeout) {
                acquired += 1;
            }
        }
        for tab in &participants {
            tab.release_mutex(lock);
        }

        let masters: Vec<&str> = participants
            .iter()
            .filter(|t| t.is_master())
            .map(|t| t.tab_id())
            .collect();
        println!(
            "round {round}: masters={masters:?} lock '{lock}' acquired {acquired}/{}",
            participants.len()
        );
    }

    for tab in &participants {
        tab.shutdown().await;
    }
    Ok(())
}

async fn elect(config: &Config, hold_secs: Option<u64>) -> Result<()> {
    let coordinator = TabCoordinator::new(config, create_store(config)?, &BroadcastHub::new());
    coordinator.start()?;
    println!("Participating as {}", coordinator.tab_id());

    let deadline = hold_secs.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut ticker = tokio::time::interval(Duration::from_millis(config.election.heartbeat_interval_ms));
    let mut was_master = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        let is_master = coordinator.is_master();
        if is_master != was_master {
            println!("{}", if is_master { "Became master" } else { "No longer master" });
            was_master = is_master;
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            break;
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn lock(
    config: &Config,
    name: &str,
    timeout_ms: Option<u64>,
    hold_ms: u64,
    attempts: u32,
) -> Result<()> {
    let coordinator = TabCoordinator::new(config, create_store(config)?, &BroadcastHub::new());
    let timeout = timeout_ms.map_or_else(|| coordinator.default_lock_timeout(), Duration::from_millis);
    let policy = RetryPolicy {
        max_attempts: attempts.max(1),
        ..RetryPolicy::from(&config.election.backoff)
    };

    let guard = coordinator.acquire_with_retry(name, timeout, &policy).await?;
    println!("Acquired '{name}' as {}", coordinator.tab_id());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
    }

    if guard.release() {
        println!("Released '{name}'");
    } else {
        println!("'{name}' expired before release");
    }
    coordinator.shutdown().await;
    Ok(())
}
