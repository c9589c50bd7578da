//! Omni Strategy Engine - Main Entry Point
//!
//! Dry-run only: positions are filled by the paper venue.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use omni_strategy_engine::config::{Config, TradingMode};
use omni_strategy_engine::engine::{IntervalTicker, LogTelemetry, Orchestrator, PaperVenue, RunLimit, RunSummary};
use omni_strategy_engine::feed::build_feed;
use omni_strategy_engine::strategy::{build_sources, describe_sources};
use omni_strategy_engine::utils::to_percent;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Omni Strategy Engine CLI
#[derive(Parser)]
#[command(name = "omni-strategy-engine")]
#[command(version, about = "Multi-strategy opportunity orchestrator with adaptive ranking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (extension optional)
    #[arg(short, long, global = true, default_value = "config")]
    config: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop (default)
    Run(RunArgs),

    /// List built-in strategies with their effective settings
    Strategies,

    /// Load and validate the configuration, then print it
    CheckConfig {
        /// Apply a mode preset before validating
        #[arg(short, long)]
        mode: Option<TradingMode>,
    },
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Risk preset
    #[arg(short, long)]
    mode: Option<TradingMode>,

    /// Capital under management
    #[arg(long)]
    capital: Option<Decimal>,

    /// Stop after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Simulate execution (already the default unless engine.dry_run = false)
    #[arg(long)]
    dry_run: bool,

    /// Only run these strategies (comma separated)
    #[arg(long, value_delimiter = ',')]
    strategies: Vec<String>,

    /// Seed for the simulated feed and paper fills
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_json)?;

    match cli.command {
        Some(Commands::Strategies) => list_strategies(&cli.config),
        Some(Commands::CheckConfig { mode }) => check_config(&cli.config, mode),
        Some(Commands::Run(args)) => run(&cli.config, args).await,
        None => run(&cli.config, RunArgs::default()).await,
    }
}

async fn run(config_path: &str, args: RunArgs) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Omni Strategy Engine v{} - Dry Run            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut config = Config::load_from(config_path)?;
    if let Some(mode) = args.mode {
        config.apply_mode(mode);
    }
    if let Some(capital) = args.capital {
        config.engine.total_capital = capital;
    }
    if let Some(seed) = args.seed {
        config.feed.seed = seed;
    }
    config.require_dry_run(args.dry_run)?;

    config.validate().context("Invalid configuration")?;
    log_config(&config);

    let only = (!args.strategies.is_empty()).then_some(args.strategies.as_slice());
    let sources = build_sources(&config.strategies, only)?;
    let feed = build_feed(&config.feed, &config.retry)?;
    let venue = PaperVenue::new(config.feed.seed);

    let mut orchestrator =
        Orchestrator::from_config(&config, sources, feed, Box::new(venue), Box::new(LogTelemetry))
            .context("Failed to start orchestrator")?;

    let shutdown = orchestrator.shutdown_signal();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown.trigger();
    });

    let limit = RunLimit {
        max_cycles: args.cycles,
        max_duration: args.duration.map(Duration::from_secs),
    };
    let mut ticker = IntervalTicker::new(Duration::from_millis(config.engine.cycle_interval_ms));

    info!("🚀 Starting orchestration loop...");
    let summary = orchestrator.run(limit, &mut ticker).await?;
    log_summary(&summary);

    info!("👋 Omni Strategy Engine shutdown complete");
    Ok(())
}

fn list_strategies(config_path: &str) -> Result<()> {
    let config = Config::load_from(config_path)?;

    println!("{:<24} {:<8} {:>12} {:>15}", "STRATEGY", "ENABLED", "INITIAL RANK", "MIN CONFIDENCE");
    for source in describe_sources(&config.strategies) {
        println!(
            "{:<24} {:<8} {:>12} {:>15}",
            source.id, source.enabled, source.initial_rank, source.min_confidence
        );
    }
    Ok(())
}

fn check_config(config_path: &str, mode: Option<TradingMode>) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    if let Some(mode) = mode {
        config.apply_mode(mode);
    }

    config.validate().context("Invalid configuration")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("\n✅ Configuration is valid");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "omni-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("omni_strategy_engine=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true);

    if json {
        builder.json().init();
    } else {
        builder
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true)
            .init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    if let Some(mode) = config.mode {
        info!("   Mode: {}", mode);
    }
    info!("   Capital: ${}", config.engine.total_capital);
    info!("   Cycle Interval: {}ms", config.engine.cycle_interval_ms);
    info!(
        "   Max Position: {:.1}% of allocation",
        to_percent(config.risk.max_position_fraction)
    );
    info!(
        "   Max Exposure: {:.1}%",
        to_percent(config.risk.max_exposure_fraction)
    );
    info!("   Max Concurrent Positions: {}", config.risk.max_concurrent_positions);
    info!(
        "   Stop Loss / Take Profit: {:.1}% / {:.1}%",
        to_percent(config.risk.stop_loss_fraction),
        to_percent(config.risk.take_profit_fraction)
    );
    if config.allocation.percentages.is_empty() {
        info!("   Allocation: equal split");
    } else {
        for (source, share) in &config.allocation.percentages {
            info!("   Allocation {}: {:.1}%", source, to_percent(*share));
        }
    }
}

fn log_summary(summary: &RunSummary) {
    info!("📊 Run summary:");
    info!(
        "   Cycles: {} completed, {} skipped",
        summary.cycles_completed, summary.cycles_skipped
    );
    info!(
        "   Positions: {} opened, {} closed ({} at shutdown)",
        summary.positions_opened, summary.positions_closed, summary.forced_closes
    );
    info!("   Net Profit: ${:.2}", summary.net_profit);
    for ranking in &summary.rankings {
        let state = if ranking.enabled { "" } else { " (disabled)" };
        info!(
            "   {:<24} rank {:>8.2}  win rate {:>5.1}%{}",
            ranking.source_id,
            ranking.rank_score,
            to_percent(ranking.win_rate),
            state
        );
    }
    if summary.net_profit < Decimal::ZERO {
        warn!("⚠️  Run ended at a net loss");
    }
}
