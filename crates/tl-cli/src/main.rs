use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tl_runner::{ProcessRegistry, ScriptWrapper, SharedWrapper, SCRIPT_WRAPPER_NAME};
use tl_scheduler::{read, Scheduler, SerializationContext, TrellisConfig};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Closed-loop experiment scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an experiment from a configuration document.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        n_trials: Option<usize>,
    },
    /// Continue an experiment from its snapshot.
    Resume {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        n_trials: Option<usize>,
    },
    /// Fill pending metric values from a CSV ledger.
    Backfill {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a summary of a saved experiment.
    Status {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

/// Child-process registries of every script wrapper built in this process.
type Registries = Arc<Mutex<Vec<Arc<ProcessRegistry>>>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registries: Registries = Arc::default();
    let cancel = Arc::new(AtomicBool::new(false));

    let mut worker = {
        let registries = registries.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || execute(cli.command, registries, cancel))
    };

    let output = tokio::select! {
        joined = &mut worker => joined.context("scheduler task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; abandoning running trials (press ctrl-c again to stop immediately)");
            cancel.store(true, Ordering::SeqCst);
            let finished = tokio::select! {
                joined = &mut worker => Some(joined),
                _ = tokio::signal::ctrl_c() => None,
            };

            let terminated: usize = registries.lock().iter().map(|r| r.terminate_all()).sum();
            warn!(terminated, "terminated running models");
            match finished {
                Some(Ok(Ok(summary))) => println!("{}", serde_json::to_string_pretty(&summary)?),
                Some(Ok(Err(err))) => warn!(error = %format!("{err:#}"), "scheduler stopped with an error"),
                Some(Err(err)) => warn!(error = %err, "scheduler task panicked"),
                None => warn!("scheduler did not wind down; snapshot may be one batch behind"),
            }
            anyhow::bail!("interrupted");
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute(command: Commands, registries: Registries, cancel: Arc<AtomicBool>) -> Result<Value> {
    match command {
        Commands::Run {
            config,
            snapshot,
            n_trials,
        } => {
            let mut config = TrellisConfig::from_path(&config)
                .with_context(|| format!("failed to load configuration {}", config.display()))?;
            if let Some(path) = snapshot {
                config.scheduler.snapshot_path = Some(path);
            }
            if let Some(n) = n_trials {
                config.scheduler.n_trials = Some(n);
                config.scheduler.total_trials = None;
            }

            let (mut scheduler, wrapper) = config
                .build_script_scheduler()
                .context("failed to build scheduler")?;
            registries.lock().push(wrapper.processes());
            scheduler.set_cancel_flag(cancel);

            let summary = scheduler.run_all_trials().context("experiment run failed")?;
            Ok(serde_json::to_value(summary)?)
        }
        Commands::Resume { snapshot, n_trials } => {
            let mut scheduler = load_scheduler(&snapshot, &registries)?;
            scheduler.set_cancel_flag(cancel);
            let summary = match n_trials {
                Some(n) => scheduler.run_n_trials(n),
                None => scheduler.run_all_trials(),
            }
            .context("resumed run failed")?;
            Ok(serde_json::to_value(summary)?)
        }
        Commands::Backfill { snapshot, csv } => {
            let mut scheduler = load_scheduler(&snapshot, &registries)?;
            let report = scheduler
                .reconcile_backfill(&csv)
                .with_context(|| format!("failed to reconcile {}", csv.display()))?;
            let written = scheduler.save_snapshot(&snapshot)?;
            info!(path = %written.display(), replaced = report.replaced, "snapshot updated");
            Ok(json!({
                "backfill": report,
                "summary": scheduler.summary(),
            }))
        }
        Commands::Status { snapshot } => status(&snapshot),
    }
}

/// Load a snapshot, recording any script wrapper's process registry and
/// keeping further saves on the same file.
fn load_scheduler(path: &Path, registries: &Registries) -> Result<Scheduler> {
    let mut context = SerializationContext::with_defaults();
    let sink = registries.clone();
    context.register_wrapper(SCRIPT_WRAPPER_NAME, move |descriptor| {
        let wrapper = ScriptWrapper::from_descriptor(descriptor)?;
        sink.lock().push(wrapper.processes());
        Ok(Arc::new(wrapper) as SharedWrapper)
    });

    let mut scheduler = tl_scheduler::load(path, &context)
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    scheduler.options_mut().snapshot_path = Some(path.to_path_buf());
    Ok(scheduler)
}

fn status(path: &Path) -> Result<Value> {
    let document = read(path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let experiment = &document.experiment;
    let best = experiment.best_trial().map(|(index, objective)| {
        json!({
            "index": index,
            "objective": objective,
            "parameters": experiment.trial(index).ok().and_then(|t| t.parameters().ok()),
        })
    });

    Ok(json!({
        "experiment": experiment.name,
        "num_trials": experiment.num_trials(),
        "status_counts": experiment.status_counts(),
        "pending_cells": experiment.observations().pending_cells().len(),
        "best_trial": best,
        "generation_strategy": {
            "name": document.generation_strategy.name(),
            "current_step": document.generation_strategy.current_step_index(),
            "generated": document.generation_strategy.num_generated(),
        },
        "wrapper": document.wrapper,
    }))
}
