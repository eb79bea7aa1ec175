//! firmheap host binary
//!
//! Runs the memory manager and its dispatcher on the host:
//! - Dispatcher loop with collector, heartbeat and health tasks
//! - Payload staging, verification and launch
//! - Deterministic allocation workload for inspecting pool behavior
//!
//! # Examples
//!
//! ```bash
//! # Run the dispatcher for ten seconds
//! firmheap run --duration-secs 10
//!
//! # Stage and launch a payload
//! firmheap run --payload app.bin --sha256 9f86d0...
//!
//! # Check a payload digest without launching it
//! firmheap load app.bin
//!
//! # Exercise the allocator and print stats as JSON
//! firmheap simulate --rounds 20 --json
//! ```

use clap::{Args, Parser, Subcommand};
use firmheap::loader::{FirmwareLoader, HostLauncher};
use firmheap::memory::MemoryManager;
use firmheap::scheduler::{HealthChecker, Scheduler, Watchdog};
use firmheap::simulation::run_workload;
use firmheap::{metrics, Settings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// firmheap - hybrid memory manager for single-board firmware
#[derive(Parser, Debug)]
#[command(name = "firmheap")]
#[command(version = firmheap::VERSION)]
#[command(about = "Hybrid slab/system memory manager with a cooperative dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "FIRMHEAP_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "FIRMHEAP_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher, optionally launching a payload
    Run(RunArgs),

    /// Stage and verify a payload without launching it
    Load(LoadArgs),

    /// Drive a deterministic allocation workload and print stats
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Payload file to stage and launch
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Expected SHA-256 of the payload (hex)
    #[arg(long, requires = "payload")]
    sha256: Option<String>,

    /// Stop after this many seconds (default: until Ctrl-C)
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Payload file
    file: PathBuf,

    /// Expected SHA-256 of the payload (hex)
    #[arg(long)]
    sha256: Option<String>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Workload rounds
    #[arg(short, long, default_value = "10")]
    rounds: usize,

    /// Print stats as JSON
    #[arg(long)]
    json: bool,

    /// Also print Prometheus metrics
    #[arg(long)]
    metrics: bool,
}

// Current-thread runtime: the dispatcher and the loader share one thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    metrics::init_metrics();

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_command(settings, args).await,
        Commands::Load(args) => load_command(settings, args).await,
        Commands::Simulate(args) => simulate_command(settings, args),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "firmheap.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Run command - dispatcher loop plus optional payload launch
async fn run_command(settings: Settings, args: RunArgs) -> anyhow::Result<()> {
    info!(version = %firmheap::VERSION, "firmheap starting");

    let manager = MemoryManager::new(settings.memory.clone())?;
    let watchdog = Watchdog::new(settings.scheduler.watchdog_timeout());
    let health = HealthChecker::new();
    let mut scheduler =
        Scheduler::with_default_tasks(&settings.scheduler, &manager, &watchdog, &health);
    health.set_startup_complete().await;

    let duration_secs = args.duration_secs;
    let shutdown = async move {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    let loader = FirmwareLoader::new(manager.clone(), settings.loader.clone());
    let payload_job = async {
        let Some(path) = args.payload.as_deref() else {
            return Ok(());
        };
        let staged = loader.stage_file(path).await?;
        let verified = loader.authorize(staged, args.sha256.as_deref())?;
        let mut launcher = HostLauncher::new();
        verified.launch(&mut launcher)
    };

    let (dispatch, payload) = tokio::join!(scheduler.run_until(shutdown), payload_job);

    for task in scheduler.task_stats() {
        info!(task = task.name, runs = task.runs, failures = task.failures, "Task summary");
    }
    let status = health.get_status().await;
    info!(status = %status.status, uptime = status.uptime_seconds, "Final health");

    if let Err(e) = dispatch {
        // Host stand-in for the hardware reset
        error!(error = %e, "Dispatcher stopped on fatal error");
        return Err(e.into());
    }
    if let Err(e) = payload {
        error!(error = %e, "Payload failed");
        return Err(e.into());
    }

    info!("firmheap stopped");
    Ok(())
}

/// Load command - stage and verify only
async fn load_command(settings: Settings, args: LoadArgs) -> anyhow::Result<()> {
    let manager = MemoryManager::new(settings.memory.clone())?;
    let loader = FirmwareLoader::new(manager.clone(), settings.loader);

    let staged = loader.stage_file(&args.file).await?;
    println!("File:    {}", args.file.display());
    println!("Size:    {} bytes", staged.len());
    println!("Region:  {}", staged.region());
    println!("SHA-256: {}", staged.digest());

    match args.sha256 {
        Some(expected) => {
            staged.verify(&expected)?;
            println!("✅ Digest verified");
        }
        None => {
            println!("⚠️  No digest supplied; payload not verified");
        }
    }
    Ok(())
}

/// Simulate command - deterministic allocate/free/compact/sweep workload
fn simulate_command(settings: Settings, args: SimulateArgs) -> anyhow::Result<()> {
    let manager = MemoryManager::new(settings.memory)?;
    let report = run_workload(&manager, args.rounds)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = &report.stats;
        println!("Simulation ({} rounds)", report.rounds);
        println!("───────────────────────────────");
        println!("Failed allocations: {}", report.failures);
        println!("Pool blocks:        {}/{}", stats.blocks_in_use, stats.blocks_total);
        println!("Heap in use:        {} / {} bytes", stats.heap_in_use, stats.heap_capacity);
        println!("Live slots:         {}", stats.live_slots);
        println!("Tracked:            {}", stats.tracked_allocations);
        println!("Compactions:        {}", stats.compactions);
        println!("Sweeps:             {}", stats.sweeps);
        println!(
            "After teardown:     {} blocks, {} heap bytes, {} tracked",
            report.remaining.blocks_in_use,
            report.remaining.heap_in_use,
            report.remaining.tracked_allocations
        );
    }

    if args.metrics {
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}
