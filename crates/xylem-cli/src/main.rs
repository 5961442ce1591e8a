//! Xylem CLI - run mapping pipelines over NDJSON records

mod builtins;
mod config;
mod io;
mod logging;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use config::Config;
use indicatif::{ProgressBar, ProgressStyle};
use io::{Destination, NdjsonOutputFactory};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xylem::{
    Environment, ExecuteError, FailureListener, MappingRegistry, Output, OutputError,
    OutputFactory, PanicPolicy, Pipeline, RunSummary, Step, TaskFailure,
};

type Registry = MappingRegistry<String, Value>;

/// Parse a `--step` argument: `name` or `name:option=value,option=value`.
///
/// Option values are read as JSON when they parse, as strings otherwise.
fn parse_step(s: &str) -> Result<Step, String> {
    let (name, options) = match s.split_once(':') {
        Some((name, options)) => (name, Some(options)),
        None => (s, None),
    };
    if name.is_empty() {
        return Err(format!("Invalid step '{}': missing mapping name", s));
    }

    let mut step = Step::new(name);
    for pair in options.into_iter().flat_map(|o| o.split(',')) {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid option '{}' in step '{}'. Use key=value", pair, s))?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
        step = step.option(key, value);
    }
    Ok(step)
}

#[derive(Clone, Copy)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn info(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            eprintln!("{msg}");
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            eprintln!("[debug] {msg}");
        }
    }
}

#[derive(Parser)]
#[command(name = "xylem")]
#[command(about = "Concurrent key/value transform pipelines", long_about = None)]
struct Cli {
    /// Verbose output (show debug info)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (default: ~/.config/xylem/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available mappings
    Mappings,

    /// Validate a pipeline file and show its steps
    Check {
        /// Pipeline file (YAML, TOML, or JSON)
        pipeline: PathBuf,
    },

    /// Run a pipeline over NDJSON records
    Run {
        /// Pipeline file (YAML, TOML, or JSON). Steps may also be given with --step.
        pipeline: Option<PathBuf>,
        /// Input file (use "-" for stdin). Overrides the pipeline's input.
        #[arg(short, long)]
        input: Option<String>,
        /// Output file (use "-" for stdout). Overrides the pipeline's output.
        #[arg(short, long)]
        output: Option<String>,
        /// Append a step: name or name:option=value,option=value
        #[arg(short, long = "step", value_parser = parse_step)]
        steps: Vec<Step>,
        /// Worker threads (0 = all cores, 1 = inline)
        #[arg(short = 'j', long)]
        parallelism: Option<usize>,
        /// Retries per failed record before giving up on it
        #[arg(long)]
        retries: Option<usize>,
        /// Drop records that still fail after retries instead of aborting
        #[arg(long)]
        drop_failed: bool,
        /// Treat a panicking mapping like a failing one
        #[arg(long)]
        isolate_panics: bool,
        /// Print the run summary as JSON on stderr
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    // Apply config defaults, CLI flags override
    let verbose = cli.verbose || config.defaults.verbose;
    let quiet = cli.quiet || config.defaults.quiet;
    let verbosity = Verbosity::from_flags(verbose, quiet);
    logging::init(config.log_level(verbose, quiet));

    let mut registry = Registry::new();
    builtins::register_all(&mut registry);

    match cli.command {
        Commands::Mappings => cmd_mappings(&registry),
        Commands::Check { pipeline } => cmd_check(&registry, &pipeline),
        Commands::Run {
            pipeline,
            input,
            output,
            steps,
            parallelism,
            retries,
            drop_failed,
            isolate_panics,
            json,
        } => {
            let mut pipeline = match pipeline {
                Some(path) => load_pipeline(&path)?,
                None => Pipeline::new(),
            };

            if let Some(input) = input {
                pipeline.input = Some(input);
            }
            if let Some(output) = output {
                pipeline.output = Some(output);
            }
            pipeline.steps.extend(steps);
            if let Some(parallelism) = parallelism.or(config.defaults.parallelism) {
                pipeline.execution.parallelism = Some(parallelism);
            }
            if drop_failed {
                pipeline.execution.drop_failed_tasks = true;
            }
            if isolate_panics {
                pipeline.execution.panic_policy = PanicPolicy::Isolate;
            }

            let retries = retries.or(config.defaults.retries).unwrap_or(0);
            cmd_run(&registry, &pipeline, retries, json, verbosity)
        }
    }
}

fn load_pipeline(path: &Path) -> Result<Pipeline> {
    let data = std::fs::read(path).context("Failed to read pipeline file")?;
    Pipeline::from_bytes(&data, Some(&path.to_string_lossy()))
        .map_err(|e| anyhow!("Failed to parse pipeline: {}", e))
}

fn cmd_mappings(registry: &Registry) -> Result<()> {
    println!("Available mappings:\n");

    for decl in registry.declarations() {
        println!("  {}", decl.id);
        if !decl.description.is_empty() {
            println!("    {}", decl.description);
        }
    }

    println!();
    println!("Total: {} mappings", registry.len());
    Ok(())
}

fn cmd_check(registry: &Registry, path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;

    println!("Pipeline: {}", path.display());
    println!();
    println!("Input:  {}", pipeline.input.as_deref().unwrap_or("(stdin)"));
    println!("Output: {}", pipeline.output.as_deref().unwrap_or("(stdout)"));
    println!();

    if pipeline.steps.is_empty() {
        println!("Steps: (none, records pass through unchanged)");
    } else {
        println!("Steps:");
        for (i, step) in pipeline.steps.iter().enumerate() {
            println!("  {}. {}", i + 1, step.mapping);
            if !step.options.is_empty() {
                println!("     options: {:?}", step.options);
            }
        }
    }
    println!();

    registry
        .build_chain(&pipeline.steps)
        .context("Invalid pipeline")?;

    let execution = &pipeline.execution;
    println!(
        "Execution: parallelism={}, drop_failed_tasks={}, panic_policy={:?}",
        execution
            .parallelism
            .map_or_else(|| "1".to_string(), |n| n.to_string()),
        execution.drop_failed_tasks,
        execution.panic_policy
    );
    println!();
    println!("Status: valid");
    Ok(())
}

/// Retries each failed record up to `retries` times, then leaves it failed.
fn retry_listener(retries: usize) -> impl FailureListener<String, Value> {
    move |failure: &TaskFailure<String, Value>| {
        let attempt = failure.attempt() as usize;
        if attempt <= retries {
            tracing::info!(key = %failure.key(), attempt, "retrying record");
            if let Err(e) = failure.retry() {
                tracing::warn!(key = %failure.key(), error = %e, "retry failed");
            }
        } else {
            tracing::warn!(key = %failure.key(), error = %failure.cause(), "giving up on record");
        }
    }
}

/// Output wrapper that ticks a progress spinner per record written.
struct Progress<O> {
    inner: O,
    bar: ProgressBar,
}

impl<K, V, O: Output<K, V>> Output<K, V> for Progress<O> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        self.inner.write(key, value)?;
        self.bar.inc(1);
        Ok(())
    }
}

fn spinner(v: Verbosity) -> ProgressBar {
    if matches!(v, Verbosity::Quiet) {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} records written ({elapsed})")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn cmd_run(
    registry: &Registry,
    pipeline: &Pipeline,
    retries: usize,
    json: bool,
    v: Verbosity,
) -> Result<()> {
    let chain = registry
        .build_chain(&pipeline.steps)
        .context("Invalid pipeline")?;
    let env = Environment::from_config(&pipeline.execution)
        .context("Failed to set up execution environment")?;

    v.debug(&format!(
        "{} steps, concurrency {}, retries {}",
        chain.len(),
        env.concurrency(),
        retries
    ));

    let reader = io::open_input(pipeline.input.as_deref()).context("Failed to open input")?;
    let destination = Destination::parse(pipeline.output.as_deref());
    let factory = NdjsonOutputFactory::create(destination.clone())
        .context("Failed to create output")?;
    let output = factory.new_output()?;

    let bar = spinner(v);
    let mut run = env
        .start(
            reader,
            chain,
            Progress {
                inner: output,
                bar: bar.clone(),
            },
        )
        .with_listener(retry_listener(retries));

    let summary = match run.execute() {
        Ok(summary) => summary,
        Err(e) => {
            bar.abandon();
            if let ExecuteError::Stalled(failures) = &e {
                for failure in failures {
                    eprintln!("  {}: {}", failure.key(), failure.cause());
                }
            }
            if let Err(close_err) = factory.close(false) {
                tracing::warn!(error = %close_err, "failed to discard output");
            }
            return Err(anyhow::Error::new(e).context("Run failed"));
        }
    };

    factory.close(true).context("Failed to commit output")?;
    bar.finish_and_clear();
    report(&summary, &destination, json, v)
}

fn report(summary: &RunSummary, destination: &Destination, json: bool, v: Verbosity) -> Result<()> {
    if json {
        eprintln!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    let target = match destination {
        Destination::Stdout => "stdout".to_string(),
        Destination::File(path) => path.display().to_string(),
    };
    v.info(&format!(
        "Processed {} records -> {} ({} ok, {} failed, {} retried, {} dropped)",
        summary.read, target, summary.succeeded, summary.failed, summary.retried, summary.dropped
    ));
    Ok(())
}
