//! tierfetch CLI
//!
//! Loads one or more URLs through the full memory → disk → network engine
//! and prints where each load was served from.
//!
//! ```text
//! tierfetch --cache-dir /tmp/tf --repeat 2 https://img.example.com/a.png
//!   [1/2] https://img.example.com/a.png: 48213 bytes from network in 212ms
//!   [2/2] https://img.example.com/a.png: 48213 bytes from memory in 0ms
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierfetch::{LoadOutcome, LoadParams, Loader, LoaderConfig, NetworkClass};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tierfetch - tiered resource cache-and-load engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to load
    #[arg(required = true)]
    urls: Vec<String>,

    /// YAML loader configuration; flags below override it
    #[arg(long, env = "TIERFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Disk cache directory
    #[arg(long, env = "TIERFETCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Memory budget in bytes
    #[arg(long, env = "TIERFETCH_MEMORY_BUDGET")]
    memory_budget: Option<u64>,

    /// Disk budget in bytes
    #[arg(long, env = "TIERFETCH_DISK_BUDGET")]
    disk_budget: Option<u64>,

    /// Network class (constrained-mobile, broadband-mobile, wifi)
    #[arg(long, env = "TIERFETCH_NETWORK_CLASS")]
    network_class: Option<NetworkClass>,

    /// Maximum connections per download
    #[arg(long, env = "TIERFETCH_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Use relaxed timeouts and the indispensable low-speed entry
    #[arg(long)]
    indispensable: bool,

    /// Load every URL this many times
    #[arg(long, default_value = "1")]
    repeat: usize,

    /// Wipe the disk cache before loading
    #[arg(long)]
    wipe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn loader_config(&self) -> anyhow::Result<LoaderConfig> {
        let mut config = match &self.config {
            Some(path) => LoaderConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => LoaderConfig::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.disk_path = dir.clone();
        }
        if let Some(budget) = self.memory_budget {
            config.memory_budget = budget;
        }
        if let Some(budget) = self.disk_budget {
            config.disk_budget = budget;
        }
        if let Some(class) = self.network_class {
            config.network_class = class;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = args.loader_config()?;
    info!("Starting tierfetch");
    info!("  Cache dir: {}", config.disk_path.display());
    info!("  Network class: {}", config.network_class);
    info!("  Max connections: {}", config.max_connections);

    let loader = Loader::new(config).context("starting loader")?;
    if args.wipe {
        loader.wipe_disk_cache().context("wiping disk cache")?;
        info!("Disk cache wiped");
    }

    let mut params = LoadParams::new();
    if args.indispensable {
        params = params.indispensable();
    }

    let mut failures = 0usize;
    let rounds = args.repeat.max(1);
    for round in 1..=rounds {
        for url in &args.urls {
            let started = Instant::now();
            let handle = loader.load(url.as_str(), params.clone())?;
            match handle.wait().await {
                LoadOutcome::Succeed(resource) => {
                    println!(
                        "[{}/{}] {}: {} bytes from {} in {}ms",
                        round,
                        rounds,
                        url,
                        resource.resource().byte_size(),
                        resource.tier(),
                        started.elapsed().as_millis()
                    );
                    resource.mark_unused();
                }
                LoadOutcome::Failed(e) => {
                    failures += 1;
                    error!(url = %url, error = %e, "Load failed");
                    println!("[{}/{}] {}: failed: {}", round, rounds, url, e);
                }
                LoadOutcome::Canceled => {
                    failures += 1;
                    println!("[{}/{}] {}: canceled", round, rounds, url);
                }
            }
        }
    }

    println!("{}", loader.memory_report());
    println!("{}", loader.metrics());
    loader.shutdown();

    if failures > 0 {
        anyhow::bail!("{} load(s) did not succeed", failures);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("rustls=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
