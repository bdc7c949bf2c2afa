//! Autonomous Market Creation Daemon
//!
//! Creates prediction markets on a schedule and keeps a durable record of them.

use clap::{Parser, Subcommand};
use market_daemon::{
    config::Config,
    daemon::Daemon,
    news::score_relevance,
    storage::{Database, MarketFilter},
    types::MarketStatus,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "market-daemon")]
#[command(about = "Creates prediction markets on a schedule")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until a signal or the iteration limit
    Run {
        /// Simulate market creation
        #[arg(long)]
        dry_run: bool,
        /// Stop after this many cycles
        #[arg(long)]
        max_iterations: Option<u64>,
        /// Override the configured schedule (`30m`, `6h`, cron)
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Show persisted daemon state
    Status,
    /// List recorded markets
    Markets {
        /// active, resolved or cancelled
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Show aggregate statistics
    Stats,
    /// Export the store as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Import a JSON export
    Import { file: String },
    /// Score a piece of text for market relevance
    Score { text: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            dry_run,
            max_iterations,
            schedule,
        } => run_daemon(config, dry_run, max_iterations, schedule).await,
        Commands::Status => show_status(config).await,
        Commands::Markets { status, limit } => list_markets(config, status, limit).await,
        Commands::Stats => show_stats(config).await,
        Commands::Export { output } => export(config, output).await,
        Commands::Import { file } => import(config, &file).await,
        Commands::Score { text } => {
            score(&text);
            Ok(())
        }
    }
}

async fn run_daemon(
    mut config: Config,
    dry_run: bool,
    max_iterations: Option<u64>,
    schedule: Option<String>,
) -> anyhow::Result<()> {
    if dry_run {
        config.daemon.dry_run = true;
    }
    if max_iterations.is_some() {
        config.daemon.max_iterations = max_iterations;
    }
    if let Some(schedule) = schedule {
        config.daemon.schedule = schedule;
    }

    if config.daemon.dry_run {
        tracing::warn!("Running in DRY RUN mode - no markets will be created on chain");
    }

    let daemon = Daemon::from_config(config)?;
    if let Err(e) = daemon.start().await {
        tracing::error!("Failed to start daemon: {}", e);
        return Err(e.into());
    }

    let code = daemon.supervise().await;
    tracing::info!("Exiting with code {}", code);
    std::process::exit(code);
}

async fn open_store(config: &Config) -> anyhow::Result<Database> {
    Ok(Database::connect_with(&config.database.path, config.database.max_connections).await?)
}

async fn show_status(config: Config) -> anyhow::Result<()> {
    let db = open_store(&config).await?;
    let state = db.get_state().await?.unwrap_or_default();
    let stats = db.get_stats().await?;

    println!("Database:        {}", config.database.path);
    println!("Schedule:        {}", config.daemon.schedule);
    println!("Dry run:         {}", config.daemon.dry_run);
    println!("Iterations:      {}", state.iteration_count);
    match state.last_run {
        Some(at) => println!("Last run:        {}", at.to_rfc3339()),
        None => println!("Last run:        never"),
    }
    println!(
        "Markets:         {} ({} active, {} resolved, {} cancelled)",
        stats.total, stats.active, stats.resolved, stats.cancelled
    );

    db.close().await;
    Ok(())
}

async fn list_markets(config: Config, status: Option<String>, limit: u32) -> anyhow::Result<()> {
    let db = open_store(&config).await?;
    let filter = MarketFilter {
        status: status.map(|s| s.parse::<MarketStatus>()).transpose()?,
        limit: Some(limit),
        ..Default::default()
    };

    let markets = db.get_all_markets(&filter).await?;
    if markets.is_empty() {
        println!("No markets recorded");
    }
    for market in markets {
        let ends = market
            .effective_end_time()
            .map(|end| end.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|_| "never".to_string());
        println!(
            "{} [{}] {} | {} | ends {}",
            market.address, market.status, market.category, market.question, ends
        );
    }

    db.close().await;
    Ok(())
}

async fn show_stats(config: Config) -> anyhow::Result<()> {
    let db = open_store(&config).await?;
    let stats = db.get_stats().await?;
    let metrics = db.get_performance_metrics().await?;

    println!("Total markets:   {}", stats.total);
    println!("  active:        {}", stats.active);
    println!("  resolved:      {}", stats.resolved);
    println!("  cancelled:     {}", stats.cancelled);
    println!("Last 7 days:     {}", stats.created_last_7_days);
    for (category, count) in &stats.by_category {
        println!("  {:<22} {}", category, count);
    }
    println!("Total volume:    {}", metrics.total_volume);
    println!("Avg duration:    {} days", metrics.avg_duration_days.round_dp(2));
    println!("Resolution rate: {}", metrics.resolution_rate.round_dp(4));

    db.close().await;
    Ok(())
}

async fn export(config: Config, output: Option<String>) -> anyhow::Result<()> {
    let db = open_store(&config).await?;
    let json = db.export_json().await?;
    db.close().await;

    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("Exported to {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn import(config: Config, file: &str) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)?;
    let db = open_store(&config).await?;
    let summary = db.import_json(&json).await?;
    db.close().await;

    println!(
        "Imported {} market(s){}",
        summary.markets,
        if summary.state_restored { ", daemon state restored" } else { "" }
    );
    Ok(())
}

fn score(text: &str) {
    let relevance = score_relevance(text, &[], 1.0);
    println!("Score:    {}", relevance.score);
    println!("Category: {}", relevance.category.label());
    println!("Urgency:  {}", relevance.urgency);
    println!("Keywords: {}", relevance.matched_keywords.join(", "));
}
