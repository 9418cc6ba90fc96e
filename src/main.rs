//! satflow - Main Entry Point
//!
//! Feeds newline-delimited items through a configured stage pipeline and
//! writes the ordered output to stdout. Logs go to stderr and, optionally, to
//! a file.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use satflow::config::{PipelineConfig, StageConfig};
use satflow::pipeline::PipelineBuilder;
use satflow::stages::builtin_registry;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Longest the output loop waits before re-checking whether the run is done.
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(version, about = "Run items through an ordered stage pipeline")]
struct Args {
    /// Pipeline configuration (TOML). Without it a single passthrough stage is used.
    #[arg(short, long, env = "SATFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Read items from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Disable strict ordering even if the configuration enables it
    #[arg(long)]
    no_lock: bool,

    /// Print per-stage statistics as JSON to stderr when done
    #[arg(long)]
    stats_json: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,satflow=debug"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading pipeline config {}", path.display()))?,
        None => PipelineConfig::new("satflow")
            .with_stage(StageConfig::new("passthrough", "passthrough")),
    };
    if args.no_lock {
        config.use_lock = false;
    }
    Ok(config)
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_file.as_deref())?;

    let config = load_config(&args)?;
    tracing::info!(
        "Starting satflow pipeline '{}' ({} stage(s), lock {})",
        config.name,
        config.stages.len(),
        config.use_lock
    );

    let registry = builtin_registry();
    let mut pipeline = PipelineBuilder::from_config(&config, &registry)?.build()?;
    let sink = pipeline.sink();
    pipeline.start()?;

    let reader = open_input(args.input.as_deref())?;
    let input = pipeline.input().clone();
    let mut producer = Some(
        thread::Builder::new()
            .name("satflow-input".to_string())
            .spawn(move || -> Result<u64> {
                let mut fed = 0;
                for line in reader.lines() {
                    input.push(line?)?;
                    fed += 1;
                }
                Ok(fed)
            })?,
    );

    let poll = DRAIN_POLL.min(pipeline.settings().poll_timeout);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut fed = None;
    loop {
        if let Some(delivery) = sink.recv(poll)? {
            writeln!(out, "{}", *delivery)?;
            continue;
        }

        if producer.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = producer.take() {
                let count = handle
                    .join()
                    .map_err(|_| anyhow!("input thread panicked"))??;
                tracing::info!("Input exhausted after {} item(s)", count);
                fed = Some(count);
            }
        }

        if let Some(count) = fed {
            if pipeline.is_drained(count) && sink.is_empty() {
                break;
            }
        }
    }
    out.flush()?;

    pipeline.stop();

    let stats = pipeline.stats();
    for stage in &stats {
        tracing::info!(
            "Stage '{}': consumed {}, emitted {}, failures {}, baton timeouts {}",
            stage.stage,
            stage.consumed,
            stage.emitted,
            stage.failures,
            stage.baton_timeouts
        );
    }
    if args.stats_json {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }

    tracing::info!("Shutting down...");
    Ok(())
}
