//! ace-plan - inspect and exercise adaptive kernel dispatch
//!
//! # Usage
//!
//! ```bash
//! # Which strategy would a 1M element sum get?
//! ace-plan plan --size 1000000 --category reduction
//!
//! # Run a 512x512x512 multiply on the worker pool
//! ace-plan run --size 134217728 --category matmul --force parallel
//!
//! # Mixed workload, then pool and arena statistics
//! ace-plan --workers 4 stats
//! ```

mod registry;

use ace_dispatch::{Strategy, Workload};
use ace_numeric::{Category, Engine, EngineConfig, ExecOptions, Normalization, Shape};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use futures::executor::block_on;
use std::path::PathBuf;
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Inspect and exercise adaptive kernel dispatch
#[derive(Parser, Debug)]
#[command(name = "ace-plan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Worker pool size
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the strategy and chunking a call would get
    Plan {
        /// Input size (elements; multiply-adds for matrix multiply)
        #[arg(long)]
        size: usize,

        /// Operation category
        #[arg(long)]
        category: Category,
    },

    /// Run one kernel on generated data
    Run {
        /// Input size (elements; multiply-adds for matrix multiply)
        #[arg(long)]
        size: usize,

        /// Operation category
        #[arg(long)]
        category: Category,

        /// Use this strategy instead of selecting one
        #[arg(long)]
        force: Option<Strategy>,

        /// Seed for the generated data
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Run a small mixed workload and print engine statistics
    Stats {
        /// Rounds of the workload
        #[arg(long, default_value = "3")]
        rounds: usize,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_process_env();
    if let Some(workers) = cli.workers {
        config.pool.max_workers = workers;
    }
    Ok(config)
}

/// Values in `[-1, 1)` drawn from `rng`.
fn generate(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn print_plan(engine: &Engine, size: usize, category: Category) {
    let plan = engine.execution_plan(size, category);
    println!("category:  {category}");
    println!("size:      {size}");
    println!("strategy:  {}", plan.strategy);
    println!("workers:   {}", plan.workers);
    println!("chunks:    {}", plan.chunk_count());
    if plan.chunk_count() > 1 {
        let first = &plan.chunks[0];
        println!("chunk len: {} (split over {} units)", first.len(), plan.workload.units);
    }
}

fn summarize(values: &[f64]) -> String {
    let checksum: f64 = values.iter().sum();
    let head: Vec<String> = values.iter().take(4).map(|v| format!("{v:.6}")).collect();
    format!(
        "{} values [{}{}], checksum {checksum:.6}",
        values.len(),
        head.join(", "),
        if values.len() > 4 { ", ..." } else { "" }
    )
}

fn run_kernel(
    engine: &Engine,
    size: usize,
    category: Category,
    force: Option<Strategy>,
    seed: u64,
) -> Result<String> {
    let opts = ExecOptions {
        force,
        size_hint: None,
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let summary = match category {
        Category::ElementWise => {
            let a = generate(&mut rng, size);
            let b = generate(&mut rng, size);
            summarize(&block_on(engine.add(&a, &b, opts))?)
        }
        Category::Reduction => {
            let a = generate(&mut rng, size);
            let sum = block_on(engine.sum(&a, opts))?;
            if a.is_empty() {
                format!("sum {sum:.6}")
            } else {
                let std = block_on(engine.std(&a, Normalization::Unbiased, opts))?;
                format!("sum {sum:.6}, std {std:.6}")
            }
        }
        Category::DotProduct => {
            let a = generate(&mut rng, size);
            let b = generate(&mut rng, size);
            format!("dot {:.6}", block_on(engine.dot_product(&a, &b, opts))?)
        }
        Category::MatrixMultiply => {
            let side = Workload::from_size(category, size).units;
            let shape = Shape::new(side, side);
            let a = generate(&mut rng, shape.len());
            let b = generate(&mut rng, shape.len());
            let c = block_on(engine.multiply(&a, shape, &b, shape, opts))?;
            format!("{shape} product: {}", summarize(&c))
        }
        Category::Transpose => {
            let side = Workload::from_size(category, size).units;
            let shape = Shape::new(side, side);
            let a = generate(&mut rng, shape.len());
            let t = block_on(engine.transpose(&a, shape, opts))?;
            format!("{shape} transpose: {}", summarize(&t))
        }
    };
    Ok(summary)
}

fn run_stats(engine: &Engine, rounds: usize) -> Result<()> {
    let sizes = [100, 5_000, 250_000];
    for round in 0..rounds {
        for &size in &sizes {
            for category in Category::ALL {
                let size = match category {
                    Category::MatrixMultiply => size.min(100_000),
                    _ => size,
                };
                run_kernel(engine, size, category, None, round as u64)?;
            }
        }
    }

    let caps = engine.capabilities();
    println!("capabilities: accelerated={} parallel={}", caps.accelerated, caps.parallel);

    if let Some(stats) = engine.pool_stats() {
        println!(
            "pool:    total={} busy={} idle={} queued={} active={}",
            stats.total, stats.busy, stats.idle, stats.queued, stats.active
        );
    }
    if let Some(metrics) = engine.metrics() {
        println!(
            "metrics: executed={} total={:?} average={:?} peak={} rejected={} faults={} respawns={}",
            metrics.tasks_executed,
            metrics.total_execution_time,
            metrics.average_execution_time,
            metrics.peak_concurrency,
            metrics.tasks_rejected,
            metrics.worker_faults,
            metrics.respawns,
        );
    }
    if let Some(counters) = engine.arena_counters() {
        println!(
            "arena:   fresh={} reused={} bypassed={} evicted={} failed={}",
            counters.fresh_allocations,
            counters.reuses,
            counters.bypassed,
            counters.evictions,
            counters.failed_allocations,
        );
    }
    for (tag, stats) in engine.arena_stats() {
        println!(
            "  {tag}: count={} in_use={} bytes={}",
            stats.count, stats.in_use_count, stats.total_bytes
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let engine = registry::init(config).context("building engine")?;

    match cli.command {
        Commands::Plan { size, category } => print_plan(engine, size, category),
        Commands::Run {
            size,
            category,
            force,
            seed,
        } => {
            match force {
                Some(strategy) => println!("strategy: {strategy} (requested)"),
                None => println!("strategy: {}", engine.execution_plan(size, category).strategy),
            }
            let start = Instant::now();
            let summary = run_kernel(engine, size, category, force, seed)?;
            println!("result:   {summary}");
            println!("elapsed:  {:?}", start.elapsed());
        }
        Commands::Stats { rounds } => run_stats(engine, rounds)?,
    }

    if let Some(engine) = registry::global() {
        engine.terminate(false, None);
    }
    Ok(())
}
