//! CLI entry point for race-timer.
//!
//! ```bash
//! race-timer run --config config/race-timer.toml
//! race-timer run --simulate 4
//! race-timer discover
//! race-timer config
//! race-timer analyze trace.csv --window 10
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use race_timer::analyze::{analyze, read_trace_file};
use race_timer::app;
use race_timer::config::{TimerConfig, DEFAULT_CONFIG_PATH};
use race_timer::logging;
use race_timer::timer_hardware::Clock;

#[derive(Parser)]
#[command(name = "race-timer")]
#[command(about = "Multi-node drone race timer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll nodes and time a race until Ctrl+C
    Run {
        /// Use a simulated track with this many nodes instead of real links
        #[arg(long)]
        simulate: Option<usize>,
    },

    /// List processors and nodes on the configured links
    Discover {
        /// Scan a simulated track with this many nodes instead
        #[arg(long)]
        simulate: Option<usize>,
    },

    /// Print the effective configuration (file merged with environment)
    Config,

    /// Persistence report and suggested levels for a recorded time,rssi CSV
    Analyze {
        /// CSV file with `time,rssi` columns
        csv: PathBuf,

        /// Extrema window for the realtime lifetime estimate
        #[arg(long, default_value = "10")]
        window: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TimerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run { simulate } => run(&config, simulate).await,
        Commands::Discover { simulate } => discover(&config, simulate).await,
        Commands::Config => {
            print!("{}", config.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
        Commands::Analyze { csv, window } => analyze_file(&config, csv, window),
    }
}

async fn run(config: &TimerConfig, simulate: Option<usize>) -> Result<()> {
    let (links, _simulator) = match simulate {
        Some(nodes) => {
            let (links, handle) = app::simulated_links(nodes, config);
            (links, Some(handle))
        }
        None => (app::open_links(config).await?, None),
    };

    let (handle, task) = app::start(&links, config, None).await?;
    let start_ms = handle.race_start(None).await?;
    info!(start_ms, "Race running; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    for (node, cal) in handle.race_stop().await? {
        println!(
            "Node {}: enter {} exit {} (peak {}, floor {})",
            node + 1,
            cal.enter_at_level,
            cal.exit_at_level,
            cal.peak,
            cal.floor
        );
    }
    for summary in handle.snapshot().await? {
        println!(
            "Node {} [{}@{:#04x}] {} MHz, laps {:?}, {}",
            summary.index + 1,
            summary.link,
            summary.address,
            summary.frequency,
            summary.pass_count,
            summary.io.error_report()
        );
    }

    handle.shutdown();
    let report = task.await.context("Poll loop panicked")?;
    println!("{}", report);
    Ok(())
}

async fn discover(config: &TimerConfig, simulate: Option<usize>) -> Result<()> {
    let links = match simulate {
        Some(nodes) => app::simulated_links(nodes, config).0,
        None => app::open_links(config).await?,
    };
    let found = app::discover_nodes(&links, config, Clock::new()).await;

    for processor in &found.processors {
        println!("{}", processor);
        if let Some(build) = &processor.firmware_build {
            println!("  built {}", build);
        }
    }
    for node in &found.nodes {
        println!(
            "Node {}: sub {:?} slot {:?} {} MHz enter {} exit {} mode {:?}",
            node.index() + 1,
            node.state.multi_node_index,
            node.state.slot_index,
            node.state.frequency,
            node.state.enter_at_level,
            node.state.exit_at_level,
            node.state.mode
        );
    }
    if found.nodes.is_empty() {
        println!("No nodes found");
    }
    Ok(())
}

fn analyze_file(config: &TimerConfig, csv: PathBuf, window: usize) -> Result<()> {
    let trace = read_trace_file(&csv)?;
    let analysis = analyze(&trace, &config.calibration.policy(), window);
    println!("{}", analysis);
    Ok(())
}
