#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replsched::config::{self, ReplschedConfig, CONFIG_DIR, CONFIG_FILE};
use replsched::metrics::http::serve_metrics;
use replsched::metrics::MetricsRegistry;
use replsched::simulation::{embedding_service, Pipeline, SimulationOptions, SimulationReport};

#[derive(Parser)]
#[command(name = "replsched")]
#[command(about = "Generation-scoped batch scheduler for index replication", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./.replsched/config.toml, then ~/.replsched/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate synthetic generations once and print a report
    Simulate {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replicate synthetic generations in rounds and serve Prometheus metrics
    Serve {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Pause between rounds in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Stop after this many rounds (runs until SIGINT/SIGTERM otherwise)
        #[arg(long)]
        rounds: Option<usize>,
    },

    /// Manage configuration (.replsched/config.toml)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Args)]
struct WorkloadArgs {
    /// Generations replicated concurrently
    #[arg(long, default_value_t = 4)]
    generations: usize,
    /// Batches per generation
    #[arg(long, default_value_t = 8)]
    batches: usize,
    /// Documents per batch
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    /// Indexing time per document in microseconds
    #[arg(long, default_value_t = 0)]
    index_delay_us: u64,
    /// Fail one batch of the first generation to exercise recovery
    #[arg(long)]
    inject_failure: bool,
    /// Only replicate plain search indexes
    #[arg(long)]
    no_embedding: bool,
}

impl WorkloadArgs {
    fn options(&self) -> SimulationOptions {
        SimulationOptions {
            generations: self.generations,
            batches: self.batches,
            batch_size: self.batch_size.max(1),
            index_delay: Duration::from_micros(self.index_delay_us),
            inject_failure: self.inject_failure,
            embedding: !self.no_embedding,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default config.toml in .replsched/ directory
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Show path to the config file
    Path,
    /// Show the effective config (default)
    Show,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Config { action } => handle_config(action, config_path.as_deref()),
        Commands::Simulate { workload, json } => {
            let config = load(config_path.as_deref(), &cli.log_level)?;
            runtime(&config)?.block_on(handle_simulate(config, workload.options(), json))
        }
        Commands::Serve {
            workload,
            interval_ms,
            rounds,
        } => {
            let config = load(config_path.as_deref(), &cli.log_level)?;
            runtime(&config)?.block_on(handle_serve(
                config,
                workload.options(),
                Duration::from_millis(interval_ms),
                rounds,
            ))
        }
    }
}

/// Structured JSON logging by default, text via REPLSCHED_LOG_TEXT=1.
/// Logs go to stderr so reports on stdout stay parseable.
fn init_logging(log_level: &str) {
    let text_logging = std::env::var("REPLSCHED_LOG_TEXT")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("replsched={}", log_level).into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

fn load(explicit: Option<&Path>, log_level: &str) -> anyhow::Result<ReplschedConfig> {
    init_logging(log_level);
    let (config, path) = config::load_config(explicit)?;
    match path {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }
    Ok(config)
}

fn runtime(config: &ReplschedConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    // Decoding and indexing run on the blocking pool.
    let blocking_threads = (config.decoding.concurrency + config.indexing.concurrency).max(num_cpus);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads((num_cpus / 2).max(2))
        .max_blocking_threads(blocking_threads)
        .thread_name("replsched-worker")
        .enable_all()
        .build()?;

    tracing::info!(
        "Tokio runtime configured: {} worker threads, {} max blocking threads",
        (num_cpus / 2).max(2),
        blocking_threads
    );
    Ok(rt)
}

// === CLI handlers ===

async fn handle_simulate(
    config: ReplschedConfig,
    options: SimulationOptions,
    json: bool,
) -> anyhow::Result<()> {
    let registry = Arc::new(MetricsRegistry::new());
    let pipeline = Pipeline::new(&config, registry, embedding_service(&config).await);
    let result = pipeline.run(&options).await;
    pipeline.shutdown().await;
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("Generations:        {}", report.generations);
    println!("Batches indexed:    {}", report.batches_indexed);
    println!("Documents indexed:  {}", report.documents_indexed);
    println!("Failed batches:     {}", report.failed_batches);
    println!("Recovered:          {}", report.recovered_generations);
    println!("Elapsed:            {} ms", report.elapsed_ms);
    println!();
    for scheduler in &report.schedulers {
        println!(
            "{:<48} processed {:>6} batches, {:>8} events, {:>3} failed",
            scheduler.scope,
            scheduler.processed_batches,
            scheduler.processed_events,
            scheduler.failed_batches
        );
    }
}

async fn handle_serve(
    config: ReplschedConfig,
    options: SimulationOptions,
    interval: Duration,
    rounds: Option<usize>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, initiating graceful shutdown");
            }
        }
        token.cancel();
    });

    let registry = Arc::new(MetricsRegistry::new());
    let metrics_server = if config.metrics.enabled {
        let registry = registry.clone();
        let addr = config.metrics.listen_addr.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_metrics(&addr, registry, cancel).await {
                tracing::error!("Metrics HTTP: failed to serve on {}: {}", addr, e);
            }
        }))
    } else {
        None
    };

    let pipeline = Pipeline::new(&config, registry, embedding_service(&config).await);
    tracing::info!(pid = std::process::id(), "replsched serving simulated replication");

    let mut round = 0usize;
    while !rounds.is_some_and(|limit| round >= limit) {
        tokio::select! {
            result = pipeline.run(&options) => match result {
                Ok(report) => tracing::info!(
                    round,
                    documents = report.documents_indexed,
                    failed_batches = report.failed_batches,
                    elapsed_ms = report.elapsed_ms,
                    "Simulation round complete"
                ),
                Err(e) => tracing::error!(round, "Simulation round failed: {}", e),
            },
            _ = cancel.cancelled() => break,
        }
        round += 1;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    pipeline.shutdown().await;
    cancel.cancel();
    if let Some(server) = metrics_server {
        server.await?;
    }
    tracing::info!(rounds = round, "replsched stopped");
    Ok(())
}

fn handle_config(action: Option<ConfigAction>, explicit: Option<&Path>) -> anyhow::Result<()> {
    let local_path = std::env::current_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);

    match action {
        Some(ConfigAction::Path) => {
            let path = explicit
                .map(Path::to_path_buf)
                .or_else(|| config::search_paths().into_iter().find(|p| p.exists()))
                .unwrap_or(local_path);
            println!("{}", path.display());
        }
        Some(ConfigAction::Init { force }) => {
            let path = explicit.map(Path::to_path_buf).unwrap_or(local_path);
            config::write_default_config(&path, force)?;
            println!("Created: {}", path.display());
        }
        Some(ConfigAction::Show) | None => {
            let (config, path) = config::load_config(explicit)?;
            match path {
                Some(path) => println!("# Effective config ({})\n", path.display()),
                None => println!("# Effective config (defaults)\n"),
            }
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
