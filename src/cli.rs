//! Command-line interface
//!
//! One-shot commands (sync, positions, buy, sell, cache, errors) log to
//! console and file; `watch` runs the long-lived sync service until Ctrl-C.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::PositionStore;
use crate::chain::{
    AuctionLedger, EventListener, HttpLedgerClient, PositionSyncService, SyncUpdate,
};
use crate::config::{AppConfig, DEFAULT_CONFIG_FILE};
use crate::data_paths::{DataPaths, DEFAULT_DATA_DIR};
use crate::errors::{ErrorLog, RetryCoordinator};
use crate::logging::{init_logging, LogMode, LoggingConfig};
use crate::portfolio::PortfolioManager;
use crate::providers::ProviderPool;
use crate::types::{Position, PositionStatus, BASE_UNIT_SCALE};

#[derive(Parser)]
#[command(name = "partbot")]
#[command(version)]
#[command(about = "Token-auction position sync and trading client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Data directory path (default: ./data)
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one full position sync for an owner and persist the result
    Sync(SyncArgs),

    /// Run the live sync service (events + fallback polling) until Ctrl-C
    Watch(SyncArgs),

    /// Show an owner's positions as a table
    Positions(SyncArgs),

    /// Submit a buy and track it to a terminal state
    Buy(BuyArgs),

    /// Submit a sell and track it to a terminal state
    Sell(SellArgs),

    /// Inspect or maintain the persistent position cache
    Cache(CacheArgs),

    /// Inspect the classified error log of this session
    Errors(ErrorsArgs),
}

#[derive(Args, Clone)]
pub struct SyncArgs {
    /// Owner account address (0x...)
    pub owner: String,
}

#[derive(Args, Clone)]
pub struct BuyArgs {
    /// Owner account address (0x...)
    pub owner: String,

    /// Amount in whole dollars
    #[arg(long)]
    pub amount: u64,

    /// Confirm submission
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Clone)]
pub struct SellArgs {
    /// Owner account address (0x...)
    pub owner: String,

    /// Position id to sell
    pub position_id: u64,

    /// Confirm submission
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Clone)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,
    /// Drop one owner's cached positions
    Clear { owner: String },
    /// Remove entries older than the hygiene window
    Cleanup,
}

#[derive(Args, Clone)]
pub struct ErrorsArgs {
    /// Owner account address to probe with a diagnostic sync
    pub owner: String,

    /// Number of most recent entries to show
    #[arg(long, default_value_t = 20)]
    pub count: usize,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = AppConfig::load(&self.config)?;
        let data_paths = DataPaths::new(&self.data_dir);
        data_paths.ensure_directories()?;

        init_logging(LoggingConfig::new(LogMode::ConsoleAndFile, data_paths.clone()))?;

        match self.command {
            Commands::Sync(args) => sync_command(&config, &data_paths, &args.owner).await,
            Commands::Watch(args) => watch_command(&config, &data_paths, &args.owner).await,
            Commands::Positions(args) => positions_command(&config, &data_paths, &args.owner).await,
            Commands::Buy(args) => buy_command(&config, &data_paths, args).await,
            Commands::Sell(args) => sell_command(&config, &data_paths, args).await,
            Commands::Cache(args) => cache_command(&data_paths, args).await,
            Commands::Errors(args) => errors_command(&config, &data_paths, args).await,
        }
    }
}

fn build_manager(config: &AppConfig, data_paths: &DataPaths, owner: &str) -> Result<PortfolioManager> {
    let providers = Arc::new(ProviderPool::new(config.provider_endpoints()));
    let ledger: Arc<dyn AuctionLedger> = Arc::new(HttpLedgerClient::new(Arc::clone(&providers))?);
    let store = PositionStore::new(data_paths.positions_file());
    Ok(PortfolioManager::new(
        owner,
        ledger,
        providers,
        store,
        config.manager_settings(),
    ))
}

async fn sync_command(config: &AppConfig, data_paths: &DataPaths, owner: &str) -> Result<()> {
    let manager = build_manager(config, data_paths, owner)?;
    let positions = manager.refresh_positions_now().await?;
    info!("synced {} positions for {}", positions.len(), owner);
    println!("{}", render_positions(&positions));
    Ok(())
}

async fn positions_command(config: &AppConfig, data_paths: &DataPaths, owner: &str) -> Result<()> {
    let manager = build_manager(config, data_paths, owner)?;
    manager.warm_start().await;
    let mut positions = manager.subscribe_state().borrow().positions.clone();
    if positions.is_empty() {
        info!("no fresh cache for {}, syncing", owner);
        positions = manager.refresh_positions_now().await?;
    }
    println!("{}", render_positions(&positions));
    Ok(())
}

async fn buy_command(config: &AppConfig, data_paths: &DataPaths, args: BuyArgs) -> Result<()> {
    if !args.yes {
        warn!("submission confirmation required, re-run with --yes");
        return Ok(());
    }
    let manager = build_manager(config, data_paths, &args.owner)?;
    let amount = u128::from(args.amount) * BASE_UNIT_SCALE;
    let outcome = manager.buy(amount, None).await?;
    println!(
        "buy {} {} ({:?})",
        outcome.hash,
        "confirmed".bright_green(),
        outcome.status
    );
    Ok(())
}

async fn sell_command(config: &AppConfig, data_paths: &DataPaths, args: SellArgs) -> Result<()> {
    if !args.yes {
        warn!("submission confirmation required, re-run with --yes");
        return Ok(());
    }
    let manager = build_manager(config, data_paths, &args.owner)?;
    let outcome = manager.sell(args.position_id).await?;
    println!(
        "sell of position {} {} ({})",
        args.position_id,
        "confirmed".bright_green(),
        outcome.hash
    );
    Ok(())
}

async fn cache_command(data_paths: &DataPaths, args: CacheArgs) -> Result<()> {
    let store = PositionStore::new(data_paths.positions_file());
    match args.action {
        CacheAction::Stats => {
            let stats = store.stats().await;
            println!("owners:      {}", stats.owners);
            println!("fresh:       {}", stats.fresh);
            println!("stale:       {}", stats.stale);
            println!("file bytes:  {}", stats.file_bytes);
        }
        CacheAction::Clear { owner } => {
            store.clear(&owner).await?;
            println!("cleared cached positions for {}", owner);
        }
        CacheAction::Cleanup => {
            let removed = store.cleanup_old_data().await?;
            println!("removed {} expired entries", removed);
        }
    }
    Ok(())
}

async fn errors_command(config: &AppConfig, data_paths: &DataPaths, args: ErrorsArgs) -> Result<()> {
    // The log is per-process; run one diagnostic sync and show everything
    // it classified along the way.
    let manager = build_manager(config, data_paths, &args.owner)?;
    if let Err(e) = manager.refresh_positions_now().await {
        warn!("diagnostic sync failed: {}", e);
    }
    let entries = manager.error_log().recent(args.count);
    if entries.is_empty() {
        println!("diagnostic sync completed with no classified errors");
        return Ok(());
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["When", "Kind", "Severity", "Operation", "Message"]);
    for entry in entries {
        table.add_row(vec![
            entry.context.timestamp.format("%H:%M:%S").to_string(),
            entry.kind.as_str().to_string(),
            format!("{:?}", entry.severity),
            entry.context.operation.clone(),
            entry.user_message.clone(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

async fn watch_command(config: &AppConfig, data_paths: &DataPaths, owner: &str) -> Result<()> {
    let providers = Arc::new(ProviderPool::new(config.provider_endpoints()));
    let ledger: Arc<dyn AuctionLedger> = Arc::new(HttpLedgerClient::new(Arc::clone(&providers))?);
    let error_log = Arc::new(ErrorLog::default());
    let retry = RetryCoordinator::new(providers, error_log);
    let sync = Arc::new(PositionSyncService::new(ledger, retry));
    let store = PositionStore::new(data_paths.positions_file());

    let listener = EventListener::start(config.event_url.clone(), owner)?;
    let (updates_tx, mut updates_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let service = tokio::spawn(Arc::clone(&sync).run(
        owner.to_string(),
        listener.subscribe(),
        updates_tx,
        shutdown_rx,
        config.sync_poll_interval(),
    ));

    info!("watching positions for {} (Ctrl-C to stop)", owner);
    // Working set for upsert merges. Re-reading through the store would
    // go through its TTL gate and could shrink the persisted entry to a
    // single position after an idle hour.
    let mut current: Vec<Position> = store.load(owner).await.unwrap_or_default();
    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                match update {
                    Some(SyncUpdate::Full { owner, positions }) => {
                        info!("full sync: {} positions", positions.len());
                        if let Err(e) = store.save(&owner, &positions).await {
                            warn!("failed to persist positions: {}", e);
                        }
                        println!("{}", render_positions(&positions));
                        current = positions;
                    }
                    Some(SyncUpdate::Upsert { owner, position }) => {
                        info!("update for position {}", position.id);
                        merge_upsert(&mut current, position);
                        if let Err(e) = store.save(&owner, &current).await {
                            warn!("failed to persist position update: {}", e);
                        }
                    }
                    Some(SyncUpdate::Failed { message, .. }) => {
                        warn!("sync failed, serving stale data: {}", message);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down watch");
                let _ = shutdown_tx.send(true);
                let _ = listener.disconnect();
                break;
            }
        }
    }
    let _ = service.await;
    Ok(())
}

/// Merge one changed position into the watch loop's working set.
fn merge_upsert(positions: &mut Vec<Position>, position: Position) {
    match positions.iter_mut().find(|p| p.id == position.id) {
        Some(existing) => *existing = position,
        None => positions.push(position),
    }
}

fn render_positions(positions: &[Position]) -> String {
    if positions.is_empty() {
        return format!("{}", "No positions found".bright_black().italic());
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Id", "Part", "League", "Tokens", "Buy Price", "Unlocks", "Status",
        ]);
    for position in positions {
        let status_display = match position.status {
            PositionStatus::Ready => "ready".bright_green().to_string(),
            PositionStatus::Locked => "locked".bright_yellow().to_string(),
            PositionStatus::Active => "active".bright_blue().to_string(),
            PositionStatus::Closed => "closed".bright_black().to_string(),
        };
        table.add_row(vec![
            position.id.to_string(),
            position.part_id.to_string(),
            position.league.as_str().to_string(),
            format_base_units(position.amount_tokens),
            format!("${}", format_base_units(position.buy_price)),
            position.unlock_at.format("%Y-%m-%d %H:%M").to_string(),
            status_display,
        ]);
    }
    table.to_string()
}

/// Render base units as a decimal string without going through floats.
fn format_base_units(value: u128) -> String {
    let whole = value / BASE_UNIT_SCALE;
    let frac = value % BASE_UNIT_SCALE;
    if frac == 0 {
        whole.to_string()
    } else {
        let frac = format!("{:06}", frac);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }
}
