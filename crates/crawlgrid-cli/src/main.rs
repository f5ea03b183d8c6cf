//! crawlgrid — command line front end for the autoscaled pool.
//!
//! # Usage
//!
//! ```text
//! crawlgrid init > crawlgrid.toml
//! crawlgrid run --config crawlgrid.toml --tasks 500 --task-millis 20
//! crawlgrid status --secs 10 --json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use crawlgrid_autoscale::AutoscaledPool;
use crawlgrid_core::CrawlGridConfig;
use crawlgrid_snapshot::Snapshotter;
use crawlgrid_status::{SystemStatus, SystemStatusSource};

#[derive(Parser)]
#[command(name = "crawlgrid", about = "Resource-aware autoscaled task pool")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic workload through the autoscaled pool.
    Run {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of tasks to run.
        #[arg(long, default_value = "100")]
        tasks: usize,

        /// How long each task sleeps, in milliseconds.
        #[arg(long, default_value = "50")]
        task_millis: u64,

        /// Make the task with this index fail.
        #[arg(long)]
        fail_at: Option<usize>,
    },

    /// Sample the host for a while and print the system status.
    Status {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seconds to sample before reporting.
        #[arg(long, default_value = "5")]
        secs: u64,

        /// Print the reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML.
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,crawlgrid=debug"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run {
            config,
            tasks,
            task_millis,
            fail_at,
        } => {
            let config = load_config(config.as_deref())?;
            run_workload(config, tasks, Duration::from_millis(task_millis), fail_at).await
        }
        Command::Status { config, secs, json } => {
            let config = load_config(config.as_deref())?;
            print_status(config, Duration::from_secs(secs), json).await
        }
        Command::Init => {
            print!("{}", CrawlGridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CrawlGridConfig> {
    match path {
        Some(path) => CrawlGridConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CrawlGridConfig::default()),
    }
}

/// Counts handed-out and completed synthetic tasks.
struct Workload {
    total: usize,
    next: AtomicUsize,
    done: AtomicUsize,
    task_duration: Duration,
    fail_at: Option<usize>,
}

impl Workload {
    fn new(total: usize, task_duration: Duration, fail_at: Option<usize>) -> Self {
        Self {
            total,
            next: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            task_duration,
            fail_at,
        }
    }

    fn is_ready(&self) -> bool {
        self.next.load(Ordering::SeqCst) < self.total
    }

    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst) >= self.total
    }

    async fn run_one(&self) -> anyhow::Result<()> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        if index >= self.total {
            return Ok(());
        }
        tokio::time::sleep(self.task_duration).await;
        if self.fail_at == Some(index) {
            bail!("synthetic task {index} failed");
        }
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_workload(
    config: CrawlGridConfig,
    tasks: usize,
    task_duration: Duration,
    fail_at: Option<usize>,
) -> anyhow::Result<()> {
    let workload = Arc::new(Workload::new(tasks, task_duration, fail_at));

    let (run, ready, finished) = (workload.clone(), workload.clone(), workload.clone());
    let pool = AutoscaledPool::builder(config.pool)
        .system_status_config(config.system_status)
        .snapshotter_config(config.snapshotter)
        .run_task(move || {
            let workload = run.clone();
            async move { workload.run_one().await }
        })
        .is_task_ready(move || {
            let workload = ready.clone();
            async move { Ok(workload.is_ready()) }
        })
        .is_finished(move || {
            let workload = finished.clone();
            async move { Ok(workload.is_finished()) }
        })
        .build()?;

    info!(tasks, task_millis = task_duration.as_millis() as u64, "running synthetic workload");

    let ctrl_c_pool = pool.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            ctrl_c_pool.abort();
        }
    });

    let started = tokio::time::Instant::now();
    pool.run().await?;

    let state = pool.state();
    info!(
        completed = workload.done.load(Ordering::SeqCst),
        elapsed_ms = started.elapsed().as_millis() as u64,
        final_desired = state.desired_concurrency,
        phase = ?state.phase,
        "workload done"
    );
    Ok(())
}

async fn print_status(
    config: CrawlGridConfig,
    sample_for: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let snapshotter = Arc::new(Snapshotter::with_os_probe(config.snapshotter)?);
    let status = SystemStatus::new(snapshotter.clone(), config.system_status)?;

    snapshotter.start();
    info!(secs = sample_for.as_secs(), "sampling system");
    tokio::time::sleep(sample_for).await;
    snapshotter.stop();

    let current = status.current_status();
    let historical = status.historical_status();

    if json {
        let out = serde_json::json!({
            "current": current,
            "historical": historical,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for (label, report) in [("current", current), ("historical", historical)] {
        println!(
            "{label:<10} idle={} overloaded={:?}",
            report.is_system_idle,
            report.overloaded_resources()
        );
        for (name, load) in [
            ("memory", report.memory),
            ("event_loop", report.event_loop),
            ("cpu", report.cpu),
            ("client", report.client),
        ] {
            println!(
                "  {name:<10} {:>6.1}% of samples overloaded (limit {:.1}%)",
                load.actual_ratio * 100.0,
                load.limit_ratio * 100.0
            );
        }
    }
    Ok(())
}
