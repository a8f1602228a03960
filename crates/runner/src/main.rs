//! Race-ace: strategy backtesting and playbook reflection for scored race data
//!
//! Usage:
//!   race-ace simulate --dataset scored.jsonl      Evaluate the strategy grid, store experience
//!   race-ace reflect --from 2025-07-01            Rebuild the playbook from stored experience
//!   race-ace run --dataset scored.jsonl           Simulate, then reflect over the dataset's dates
//!   race-ace show                                 Print the latest playbook

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use engine::{
    run_experience_loop, AceConfig, GridSpec, LoopStatus, Playbook, PlaybookBuilder, RaceDataset,
    Reflection, SimulationProgress, SimulationResult, StrategyConfig, StrategyGrid,
};
use persistence::schema::partition_bounds;
use persistence::DateRange;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "race-ace")]
#[command(about = "Backtest betting strategies on scored race data and reflect on the results", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Experience store directory (overrides config and ACE_EXPERIENCE_DIR)
    #[arg(long, global = true)]
    experience_dir: Option<PathBuf>,

    /// Playbook file (overrides config and ACE_PLAYBOOK_PATH)
    #[arg(long, global = true)]
    playbook: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the strategy grid on a scored dataset and append the experience
    Simulate {
        /// Scored runners as JSON Lines
        #[arg(long)]
        dataset: PathBuf,
        /// Grid definition (JSON); defaults to the built-in grid
        #[arg(long)]
        grid: Option<PathBuf>,
    },
    /// Build a playbook from stored experience
    Reflect {
        /// First event date (defaults to the earliest stored partition)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last event date (defaults to the latest stored partition)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Simulate, then reflect over the dataset's date span
    Run {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        grid: Option<PathBuf>,
    },
    /// Print the latest committed playbook
    Show {
        /// Print the raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,race_ace=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,race_ace=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(&cli)?;
    info!(
        experience_dir = %config.experience_dir.display(),
        playbook = %config.playbook_path.display(),
        "Race-ace v{} starting",
        APP_VERSION
    );

    let outcome = match cli.command {
        Commands::Simulate { dataset, grid } => {
            cmd_simulate(&config, &dataset, grid.as_deref()).await.map(|_| ())
        }
        Commands::Reflect { from, to } => cmd_reflect(&config, from, to),
        Commands::Run { dataset, grid } => cmd_run(&config, &dataset, grid.as_deref()).await,
        Commands::Show { json } => cmd_show(&config, json),
    };

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}

/// Defaults, then the JSON file, then environment, then CLI flags.
fn load_config(cli: &Cli) -> anyhow::Result<AceConfig> {
    let base = match &cli.config {
        Some(path) => AceConfig::from_json_file(path)?,
        None => AceConfig::default(),
    };
    let mut config = base.with_env_overrides();
    if let Some(dir) = &cli.experience_dir {
        config.experience_dir = dir.clone();
    }
    if let Some(path) = &cli.playbook {
        config.playbook_path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn load_grid(path: Option<&Path>) -> anyhow::Result<Vec<StrategyConfig>> {
    let spec = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading grid {}", path.display()))?;
            serde_json::from_str::<GridSpec>(&raw)
                .with_context(|| format!("parsing grid {}", path.display()))?
        }
        None => GridSpec::default(),
    };
    Ok(StrategyGrid::build(&spec)?)
}

fn load_dataset(path: &Path) -> anyhow::Result<RaceDataset> {
    let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;
    Ok(RaceDataset::from_jsonl(BufReader::new(file))?)
}

// ============================================================================
// Simulate: dataset → experience loop → store
// ============================================================================

async fn cmd_simulate(
    config: &AceConfig,
    dataset_path: &Path,
    grid_path: Option<&Path>,
) -> anyhow::Result<Option<DateRange>> {
    println!("\n=== Race-ace v{} ===", APP_VERSION);

    let dataset = Arc::new(load_dataset(dataset_path)?);
    let strategies = load_grid(grid_path)?;
    let store = config.experience_store()?;

    let quality = dataset.quality();
    println!(
        "Dataset: {} ({} races, {} runners, {} rows dropped)",
        dataset_path.display(),
        dataset.races().len(),
        dataset.runner_count(),
        quality.rows_dropped
    );
    println!("Strategies: {}", strategies.len());
    println!("Experience store: {}", store.root().display());
    println!("Press Ctrl+C to cancel\n");

    let span = dataset
        .date_span()
        .map(|(start, end)| DateRange { start, end });

    let progress = Arc::new(SimulationProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let loop_config = config.clone();
    let loop_progress = progress.clone();
    let handle = tokio::spawn(async move {
        run_experience_loop(dataset, strategies, &loop_config, loop_progress).await
    });

    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        if progress.status() == LoopStatus::Running {
            print_progress(&progress);
        }
    }
    println!();

    let batch = match handle.await? {
        Ok(batch) => batch,
        Err(engine::EngineError::Cancelled) => {
            println!("Cancelled, nothing written.");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    print_simulation(&batch.results);

    let summary = batch.commit(&store)?;
    println!(
        "\nStored {} records ({} new, {} replaced) across {} partition(s), {} unchanged",
        batch.records.len(),
        summary.rows_inserted,
        summary.rows_replaced,
        summary.partitions_written,
        summary.partitions_unchanged
    );

    Ok(span)
}

fn print_progress(progress: &SimulationProgress) {
    let pct = progress.progress_pct();
    let completed = progress.completed.load(Ordering::Relaxed);
    let total = progress.total.load(Ordering::Relaxed);

    let bar_len = 30;
    let filled = (pct as usize * bar_len) / 100;
    let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
    print!("\r  Simulating [{}] {:.0}% ({}/{})   ", bar, pct, completed, total);
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", precision, v),
        _ => "-".to_string(),
    }
}

fn print_simulation(results: &[SimulationResult]) {
    println!("\nSimulation results:");
    println!(
        "  {:<22} {:>6} {:>7} {:>8} {:>10} {:>8} {:>10}",
        "Strategy", "Bets", "Wins", "Hit%", "Profit", "POT%", "Settled"
    );
    println!("  {}", "-".repeat(77));
    for r in results {
        println!(
            "  {:<22} {:>6} {:>7} {:>8} {:>10} {:>8} {:>10}",
            r.strategy_id,
            r.total_bets,
            r.wins.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string()),
            fmt_opt(r.hit_rate.map(|h| h * 100.0), 1),
            fmt_opt(r.total_profit, 2),
            fmt_opt(r.pot_pct, 1),
            format!("{:?}", r.settlement).to_lowercase(),
        );
    }
}

// ============================================================================
// Reflect: store → playbook
// ============================================================================

fn resolve_range(
    config: &AceConfig,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> anyhow::Result<Option<DateRange>> {
    let partitions = config.experience_store()?.partitions()?;
    let earliest = partitions.first().and_then(|k| partition_bounds(k)).map(|(s, _)| s);
    let latest = partitions.last().and_then(|k| partition_bounds(k)).map(|(_, e)| e);

    let (Some(start), Some(end)) = (from.or(earliest), to.or(latest)) else {
        return Ok(None);
    };
    Ok(Some(DateRange::new(start, end)?))
}

fn cmd_reflect(config: &AceConfig, from: Option<NaiveDate>, to: Option<NaiveDate>) -> anyhow::Result<()> {
    let Some(range) = resolve_range(config, from, to)? else {
        println!("No stored experience; nothing to reflect on.");
        return Ok(());
    };
    reflect_range(config, &range)
}

fn reflect_range(config: &AceConfig, range: &DateRange) -> anyhow::Result<()> {
    let builder = PlaybookBuilder::from_config(config)?;
    println!("\nReflecting over {} .. {}", range.start, range.end);

    match builder.build(range, Utc::now())? {
        Reflection::Empty => {
            println!("No experience in range; playbook unchanged.");
        }
        Reflection::Ready(playbook) => {
            print_playbook(&playbook);
            println!("\nPlaybook saved to {}", config.playbook_path.display());
        }
    }
    Ok(())
}

async fn cmd_run(config: &AceConfig, dataset: &Path, grid: Option<&Path>) -> anyhow::Result<()> {
    match cmd_simulate(config, dataset, grid).await? {
        Some(range) => reflect_range(config, &range),
        None => Ok(()),
    }
}

// ============================================================================
// Show
// ============================================================================

fn cmd_show(config: &AceConfig, json: bool) -> anyhow::Result<()> {
    let builder = PlaybookBuilder::from_config(config)?;
    let Some(playbook) = builder.latest()? else {
        println!("No playbook at {}", config.playbook_path.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&playbook)?);
    } else {
        print_playbook(&playbook);
        println!("\nHistory: {} snapshot(s)", builder.history_len()?);
    }
    Ok(())
}

fn print_playbook(playbook: &Playbook) {
    let meta = &playbook.metadata;
    let global = &playbook.global;
    let sig = &playbook.significance;

    println!("\nPlaybook generated {}", meta.generated_at.to_rfc3339());
    println!(
        "  {} experience rows, {} strategies evaluated",
        meta.experience_rows, meta.strategies_evaluated
    );
    println!(
        "  Global: {} bets, profit {:+.2}, POT {}%, hit rate {}%",
        global.total_bets,
        global.total_profit,
        fmt_opt(Some(global.pot_pct), 1),
        fmt_opt(Some(global.hit_rate * 100.0), 1),
    );
    println!(
        "  Significance: {} qualifying (>= {} bets), threshold p < {:.5}{}",
        sig.qualifying,
        sig.min_bets,
        sig.effective_threshold,
        if sig.apply_correction { " (Bonferroni)" } else { "" }
    );

    if playbook.strategies.is_empty() {
        println!("\nNo strategy passed the significance filter.");
    } else {
        println!("\nTop {} strategies:", playbook.strategies.len());
        println!(
            "  {:>3}  {:<22} {:>6} {:>8} {:>8} {:>10} {:>17}",
            "#", "Strategy", "Bets", "Hit%", "POT%", "p-value", "Hit CI"
        );
        println!("  {}", "-".repeat(82));
        for (i, m) in playbook.strategies.iter().enumerate() {
            println!(
                "  {:>3}  {:<22} {:>6} {:>7.1}% {:>+8.1} {:>10.2e} [{:.3}, {:.3}]",
                i + 1,
                m.strategy_id,
                m.bets,
                m.hit_rate * 100.0,
                m.pot_pct,
                m.p_value,
                m.hit_rate_ci_low,
                m.hit_rate_ci_high,
            );
        }
    }

    if !playbook.tracks.is_empty() {
        println!("\nTracks:");
        for t in &playbook.tracks {
            println!(
                "  {:<20} {:>6} bets  POT {:>+7.1}%  hit {:>5.1}%",
                t.track,
                t.bets,
                t.pot_pct,
                t.hit_rate * 100.0
            );
        }
    }

    if !playbook.contexts.is_empty() {
        println!("\nContexts:");
        for c in &playbook.contexts {
            let label = [
                c.track.clone(),
                c.distance_band.map(|b| b.to_string()),
                c.racing_type.clone(),
                c.race_type.clone(),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" / ");
            println!("  {:<48} {:>6} bets  POT {:>+7.1}%", label, c.bets, c.pot_pct);
        }
    }
}
