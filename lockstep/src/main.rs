//! # Lockstep demo
//!
//! Loads a pipeline description (TOML), builds one synthetic-load task per
//! `[[tasks]]` entry, runs the barrier scheduler until Ctrl-C or the cycle
//! limit and reports diagnostics every `report_interval_ms`.
//!
//! Real-time policy is applied only when built with `--features rt`;
//! otherwise priorities are validated and the pipeline runs on plain threads.

use clap::Parser;
use lockstep::prelude::*;
use lockstep_common::prelude::{ConfigLoader, DEFAULT_CONFIG_PATH, LogLevel, PipelineConfig, TaskEntry};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Lockstep: barrier-scheduled real-time task pipeline
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Run a lockstep pipeline of synthetic real-time tasks")]
struct Args {
    /// Path to the pipeline configuration TOML.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many cycles (overrides pipeline.cycle_limit).
    #[arg(long, value_name = "N")]
    cycles: Option<u64>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let config = PipelineConfig::load(&args.config);
    let log_level = config
        .as_ref()
        .map_or(LogLevel::Info, |c| c.shared.log_level);
    setup_tracing(&args, log_level);

    info!("Lockstep v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = config
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        .and_then(|config| run(&args, config));
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Lockstep shutdown complete");
}

fn run(args: &Args, config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let span = tracing::info_span!("pipeline", service = %config.shared.service_name);
    let _guard = span.enter();

    let p = &config.pipeline;
    let cycle_limit = args.cycles.or(p.cycle_limit);
    info!(
        "Config OK: period={}µs, tasks={}, topology={:?}, cycle_limit={:?}",
        p.period_us,
        config.tasks.len(),
        p.topology,
        cycle_limit,
    );

    let mut builder = BarrierScheduler::builder()
        .period(PeriodicParameters::new(config.period_ns())?)
        .topology(p.topology.into())
        .lock_memory(p.lock_memory)
        .wait_strategy(WaitStrategy::from_spins(p.spin_iterations))
        .tasks(config.tasks.iter().map(synthetic_task));
    if let Some(priority) = p.driver_priority {
        builder = builder.driver_priority(PriorityParameters::new(priority));
    }
    if let Some(limit) = cycle_limit {
        builder = builder.cycle_limit(limit);
    }

    let mut scheduler = builder.build()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    scheduler.start()?;

    let report_interval = Duration::from_millis(p.report_interval_ms);
    let mut next_report = Instant::now() + report_interval;
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = cycle_limit {
            if scheduler.completed_cycles() >= limit {
                info!("Cycle limit {limit} reached");
                break;
            }
        }
        if scheduler.fatal_error().is_some() {
            break;
        }
        if Instant::now() >= next_report {
            report(&scheduler);
            next_report += report_interval;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    scheduler.stop()?;
    report(&scheduler);
    Ok(())
}

/// Log cadence, per-task counters and any queued failures.
fn report(scheduler: &BarrierScheduler) {
    let period = scheduler.period_stats();
    info!(
        cycles = period.cycles,
        overruns = period.overruns,
        max_overrun_ns = period.max_overrun_ns,
        avg_latency_ns = period.avg_latency_ns(),
        max_latency_ns = period.max_latency_ns,
        late_gates = period.late_gates,
        "period"
    );
    for task in scheduler.task_snapshots() {
        info!(
            task = %task.name,
            executions = task.executions,
            overruns = task.overruns,
            max_overrun_ns = task.max_overrun_ns,
            failures = task.failures,
            max_exec_ns = task.max_exec_ns,
            active = task.active,
            "task"
        );
    }
    for failure in scheduler.drain_failures() {
        warn!(
            task = %failure.task_name,
            cycle = failure.cycle,
            kind = ?failure.kind,
            "work failed: {}",
            failure.description
        );
    }
    let dropped = scheduler.dropped_failures();
    if dropped > 0 {
        warn!("{dropped} failure records dropped (queue full)");
    }
}

/// Busy-spins for `load` each cycle and fails every `fail_every`-th cycle.
struct SyntheticLoad {
    load: Duration,
    fail_every: u64,
}

impl Work for SyntheticLoad {
    fn execute(&mut self, ctx: &CycleContext) -> WorkResult {
        let start = Instant::now();
        while start.elapsed() < self.load {
            std::hint::spin_loop();
        }
        if self.fail_every != 0 && ctx.cycle % self.fail_every == 0 {
            return Err(format!("injected fault at cycle {}", ctx.cycle).into());
        }
        Ok(())
    }
}

fn synthetic_task(entry: &TaskEntry) -> TaskSpec {
    let spec = TaskSpec::new(
        entry.name.clone(),
        PriorityParameters::new(entry.priority),
        SyntheticLoad {
            load: Duration::from_micros(entry.load_us),
            fail_every: entry.fail_every,
        },
    );
    match &entry.affinity {
        Some(cpus) => spec.with_affinity(CpuAffinity::new(cpus.iter().copied())),
        None => spec,
    }
}

fn setup_tracing(args: &Args, log_level: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        log_level.as_directive().parse().unwrap_or(Level::INFO)
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
