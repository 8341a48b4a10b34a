//! Dispatches trials to the wrapper and polls their status.

use crossbeam_channel::unbounded;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use tl_types::{internal_error, RunMetadata, TlError, TlResult, Trial, TrialIndex, TrialStatus};

use crate::wrapper::{Instrumented, SharedWrapper};

pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Outcome of one polling pass.
#[derive(Debug, Default)]
pub struct PollReport {
    pub statuses: BTreeMap<TrialStatus, BTreeSet<TrialIndex>>,
    /// Trials whose status could not be determined.
    pub errors: Vec<(TrialIndex, TlError)>,
}

impl PollReport {
    pub fn indices_with(&self, status: TrialStatus) -> BTreeSet<TrialIndex> {
        self.statuses.get(&status).cloned().unwrap_or_default()
    }
}

/// Runs trials through a wrapper on a bounded thread pool.
pub struct JobRunner {
    wrapper: SharedWrapper,
    pool: rayon::ThreadPool,
    max_workers: usize,
}

impl JobRunner {
    /// The wrapper is instrumented here so every call is logged and tagged.
    pub fn new(wrapper: SharedWrapper) -> TlResult<Self> {
        Self::with_max_workers(wrapper, DEFAULT_MAX_WORKERS)
    }

    pub fn with_max_workers(wrapper: SharedWrapper, max_workers: usize) -> TlResult<Self> {
        let max_workers = max_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("trellis-dispatch-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to build dispatch pool: {e}"))?;

        Ok(Self {
            wrapper: Instrumented::wrap(wrapper),
            pool,
            max_workers,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn wrapper(&self) -> SharedWrapper {
        self.wrapper.clone()
    }

    /// Repoint the runner to a fresh wrapper (after loading a snapshot).
    pub fn attach_wrapper(&mut self, wrapper: SharedWrapper) {
        self.wrapper = Instrumented::wrap(wrapper);
    }

    /// `write_configs` then `run_model` for a single-arm trial.
    pub fn run(&self, trial: &Trial) -> TlResult<RunMetadata> {
        trial.single_arm()?;
        self.wrapper.write_configs(trial)?;
        self.wrapper.run_model(trial)?;

        let mut metadata = RunMetadata::new();
        metadata.insert("job_id".to_string(), Value::from(trial.index));
        Ok(metadata)
    }

    /// Run every trial concurrently and report each one's outcome.
    ///
    /// Work is submitted in slice order; every input trial appears exactly
    /// once in the result.
    pub fn dispatch(&self, trials: &[Trial]) -> BTreeMap<TrialIndex, TlResult<RunMetadata>> {
        let (tx, rx) = unbounded();

        self.pool.scope(|scope| {
            for trial in trials {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result = self.run(trial);
                    let _ = tx.send((trial.index, result));
                });
            }
        });
        drop(tx);

        let results: BTreeMap<_, _> = rx.into_iter().collect();
        debug!(dispatched = trials.len(), received = results.len(), "dispatch drained");
        results
    }

    /// Like [`dispatch`](Self::dispatch) but fails with the lowest-index
    /// error once every trial has been attempted.
    pub fn run_multiple(&self, trials: &[Trial]) -> TlResult<BTreeMap<TrialIndex, RunMetadata>> {
        let mut succeeded = BTreeMap::new();
        let mut first_error = None;

        for (index, result) in self.dispatch(trials) {
            match result {
                Ok(metadata) => {
                    succeeded.insert(index, metadata);
                }
                Err(err) => {
                    warn!(trial = index, error = %err.chain(), "trial dispatch failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(trials = succeeded.len(), "dispatched trials");
                Ok(succeeded)
            }
        }
    }

    /// One pass over the trials, collecting per-trial errors instead of
    /// stopping at the first one. Terminal trials are reported as they are.
    pub fn poll(&self, trials: &mut [Trial]) -> PollReport {
        let mut report = PollReport::default();

        for trial in trials.iter_mut() {
            if !trial.is_terminal() {
                if let Err(err) = self.wrapper.set_trial_status(trial) {
                    report.errors.push((trial.index, err));
                    continue;
                }
            }
            report.statuses.entry(trial.status()).or_default().insert(trial.index);
        }

        report
    }

    /// Single polling pass; fails on the first trial whose status could not
    /// be determined.
    pub fn poll_trial_status(&self, trials: &mut [Trial]) -> TlResult<BTreeMap<TrialStatus, BTreeSet<TrialIndex>>> {
        let report = self.poll(trials);
        match report.errors.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(report.statuses),
        }
    }
}
