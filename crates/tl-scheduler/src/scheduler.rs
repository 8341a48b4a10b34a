//! The trial scheduling loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tl_optimizer::{GenerationStrategy, OptimizerEngine};
use tl_runner::{CacheStats, FetchCache, JobRunner, MetricEvaluator, ScoringRegistry, SharedWrapper};
use tl_types::{
    config_error, Experiment, Parameters, TlError, TlResult, TrialIndex, TrialStatus,
};

use crate::options::{PollBackoff, SchedulerOptions};
use crate::snapshot;

/// Longest stretch the loop sleeps without checking for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// The best completed trial so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub index: TrialIndex,
    /// Scalarised objective, higher is better.
    pub objective: f64,
    pub parameters: Parameters,
    pub metrics: BTreeMap<String, f64>,
}

/// Aggregate view of a scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub experiment: String,
    pub num_trials: usize,
    pub status_counts: BTreeMap<TrialStatus, usize>,
    pub best_trial: Option<BestTrial>,
    pub generation_strategy: String,
    pub stop_reason: Option<String>,
    pub snapshot_path: Option<PathBuf>,
    pub fetch_cache: CacheStats,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SchedulerSummary {
    pub fn count(&self, status: TrialStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Budget {
    /// Stop once the experiment holds this many trials.
    UpTo(usize),
    Unlimited,
}

/// Drives generate → dispatch → poll → fetch → observe until a stopping
/// condition holds and nothing is running.
pub struct Scheduler {
    experiment: Experiment,
    strategy: GenerationStrategy,
    runner: JobRunner,
    evaluators: Vec<MetricEvaluator>,
    options: SchedulerOptions,
    scoring: Arc<ScoringRegistry>,
    cache: Arc<FetchCache>,
    cancel: Arc<AtomicBool>,
    stop_reason: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        experiment: Experiment,
        strategy: GenerationStrategy,
        wrapper: SharedWrapper,
        options: SchedulerOptions,
    ) -> TlResult<Self> {
        Self::with_scoring(experiment, strategy, wrapper, options, Arc::new(ScoringRegistry::with_defaults()))
    }

    pub fn with_scoring(
        experiment: Experiment,
        strategy: GenerationStrategy,
        wrapper: SharedWrapper,
        options: SchedulerOptions,
        scoring: Arc<ScoringRegistry>,
    ) -> TlResult<Self> {
        options.validate()?;

        let runner = JobRunner::with_max_workers(wrapper, options.max_pending_trials)?;
        let cache = Arc::new(FetchCache::new());
        let names = experiment.metric_names();
        let evaluators = experiment
            .metrics()
            .iter()
            .map(|metric| {
                MetricEvaluator::new(
                    metric.clone(),
                    names.clone(),
                    runner.wrapper(),
                    scoring.clone(),
                    cache.clone(),
                )
            })
            .collect::<TlResult<Vec<_>>>()?;

        info!(
            experiment = %experiment.name,
            strategy = %strategy.name(),
            wrapper = %runner.wrapper().descriptor().name,
            metrics = names.len(),
            "scheduler ready"
        );

        Ok(Self {
            experiment,
            strategy,
            runner,
            evaluators,
            options,
            scoring,
            cache,
            cancel: Arc::default(),
            stop_reason: None,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn generation_strategy(&self) -> &GenerationStrategy {
        &self.strategy
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SchedulerOptions {
        &mut self.options
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn scoring(&self) -> Arc<ScoringRegistry> {
        self.scoring.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Flag that, once set, makes the running loop abandon its running
    /// trials, save a snapshot and return.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = flag;
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Repoint the runner and every metric evaluator to a fresh wrapper.
    pub fn attach_wrapper(&mut self, wrapper: SharedWrapper) {
        self.runner.attach_wrapper(wrapper);
        let instrumented = self.runner.wrapper();
        for evaluator in &mut self.evaluators {
            evaluator.attach_wrapper(instrumented.clone());
        }
        info!(wrapper = %instrumented.descriptor().name, "wrapper attached");
    }

    // ---- run entry points ----

    /// Add up to `n` trials and run until they have all finished.
    pub fn run_n_trials(&mut self, n: usize) -> TlResult<SchedulerSummary> {
        let limit = self.experiment.num_trials() + n;
        self.run_loop(Budget::UpTo(limit))
    }

    /// Run to the configured budget (`n_trials` or `total_trials`), or until
    /// the strategy or global stopping ends the experiment.
    pub fn run_all_trials(&mut self) -> TlResult<SchedulerSummary> {
        let budget = match (self.options.n_trials, self.options.total_trials) {
            (Some(n), _) => Budget::UpTo(self.experiment.num_trials() + n),
            (None, Some(total)) => Budget::UpTo(total),
            (None, None) => {
                if !self.strategy.is_bounded() && self.options.global_stopping.is_none() {
                    return Err(config_error!(
                        "run_all_trials needs n_trials, total_trials, global_stopping or a bounded generation strategy"
                    ));
                }
                Budget::Unlimited
            }
        };
        self.run_loop(budget)
    }

    fn run_loop(&mut self, budget: Budget) -> TlResult<SchedulerSummary> {
        self.started_at.get_or_insert_with(Utc::now);
        self.stop_reason = None;
        let mut backoff = PollBackoff::new(&self.options);

        info!(
            experiment = %self.experiment.name,
            budget = ?budget,
            existing_trials = self.experiment.num_trials(),
            "starting scheduler loop"
        );

        loop {
            if self.cancelled() {
                let abandoned = self.abandon_running("interrupted")?;
                warn!(abandoned, "scheduler cancelled");
                self.stop_reason = Some("cancelled".to_string());
                break;
            }

            let running = self.experiment.count_with_status(TrialStatus::Running);
            let remaining = match budget {
                Budget::UpTo(limit) => limit.saturating_sub(self.experiment.num_trials()),
                Budget::Unlimited => usize::MAX,
            };
            let may_generate = self.stop_reason.is_none() && !self.strategy.is_done() && remaining > 0;

            if !may_generate && running == 0 {
                break;
            }

            let mut changed = false;
            if may_generate {
                let launched = self.launch_batch(remaining, running)?;
                changed |= launched > 0;
                if launched == 0 && running == 0 {
                    if !self.strategy.is_done() {
                        warn!("no candidates generated and nothing running; stopping");
                        self.stop_reason = Some("generation strategy produced no candidates".to_string());
                    }
                    break;
                }
            }

            changed |= self.poll_and_collect()?;

            if self.stop_reason.is_none() {
                if let Some(stopping) = &self.options.global_stopping {
                    if let Some(reason) = stopping.should_stop(&self.experiment) {
                        info!(reason = %reason, "global stopping triggered");
                        self.stop_reason = Some(reason);
                    }
                }
            }

            self.save_snapshot_if_configured()?;
            self.check_failure_rate()?;

            if self.experiment.count_with_status(TrialStatus::Running) > 0 {
                let wait = backoff.next(changed);
                debug!(seconds = wait.as_secs_f64(), "waiting before next poll");
                self.pause(wait);
            }
        }

        if self.stop_reason.is_none() && self.strategy.is_done() {
            self.stop_reason = Some("generation strategy exhausted".to_string());
        }
        self.finished_at = Some(Utc::now());
        self.save_snapshot_if_configured()?;

        let summary = self.summary();
        info!(
            trials = summary.num_trials,
            completed = summary.count(TrialStatus::Completed),
            failed = summary.count(TrialStatus::Failed),
            best = ?summary.best_trial.as_ref().map(|b| b.index),
            "scheduler loop finished"
        );
        Ok(summary)
    }

    /// Sleep for `wait`, waking early on cancellation.
    fn pause(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
        }
    }

    /// Mark every running trial abandoned and report it to the engine.
    fn abandon_running(&mut self, reason: &str) -> TlResult<usize> {
        let running = self.experiment.trial_indices_with_status(TrialStatus::Running);
        for &index in &running {
            self.experiment.trial_mut(index)?.mark_abandoned(reason);
            self.report_finished(index)?;
        }
        Ok(running.len())
    }

    /// Generate, create and dispatch the next batch; returns how many trials
    /// were launched.
    fn launch_batch(&mut self, remaining: usize, running: usize) -> TlResult<usize> {
        let mut capacity = self.options.max_pending_trials.saturating_sub(running);
        if let Some(parallelism) = self.strategy.max_parallelism() {
            capacity = capacity.min(parallelism.saturating_sub(running));
        }
        if self.options.run_trials_in_batches && running > 0 {
            capacity = 0;
        }
        let wanted = capacity.min(remaining);
        if wanted == 0 {
            return Ok(0);
        }

        let candidates = self.strategy.generate(wanted, &self.experiment)?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let trial = self.experiment.new_trial(candidate.parameters, candidate.generation_step);
            trial.mark_running();
            batch.push(trial.clone());
        }

        let mut failed = Vec::new();
        for (index, result) in self.runner.dispatch(&batch) {
            let trial = self.experiment.trial_mut(index)?;
            match result {
                Ok(metadata) => trial.run_metadata = metadata,
                Err(err) => {
                    trial.mark_failed(err.chain());
                    failed.push(index);
                }
            }
        }
        for index in failed {
            self.report_finished(index)?;
        }

        info!(launched = batch.len(), running = running + batch.len(), "dispatched batch");
        Ok(batch.len())
    }

    /// One polling pass. Newly finished trials are fetched and reported to
    /// the engine. Returns whether any trial changed status.
    fn poll_and_collect(&mut self) -> TlResult<bool> {
        let before: BTreeSet<TrialIndex> = self
            .experiment
            .trial_indices_with_status(TrialStatus::Running)
            .into_iter()
            .collect();
        if before.is_empty() {
            return Ok(false);
        }

        let report = self.runner.poll(self.experiment.trials_mut());
        for (index, err) in report.errors {
            warn!(trial = index, error = %err.chain(), "could not determine trial status; marking failed");
            self.experiment.trial_mut(index)?.mark_failed(err.chain());
        }

        let mut changed = false;
        for index in before {
            if self.experiment.trial(index)?.is_terminal() {
                changed = true;
                self.report_finished(index)?;
            }
        }
        Ok(changed)
    }

    /// Completed trials get their metrics fetched and observed; any other
    /// terminal status is reported to the engine as abandoned.
    fn report_finished(&mut self, index: TrialIndex) -> TlResult<()> {
        let trial = self.experiment.trial(index)?.clone();

        if trial.status() != TrialStatus::Completed {
            info!(
                trial = index,
                status = %trial.status(),
                reason = trial.failure_reason.as_deref().unwrap_or(""),
                "trial finished without data"
            );
            self.strategy.observe(&trial, None);
            return Ok(());
        }

        let observations = self
            .evaluators
            .iter()
            .map(|evaluator| evaluator.evaluate(&trial))
            .collect::<TlResult<Vec<_>>>()?;
        for observation in observations {
            self.experiment.attach_observation(observation)?;
        }

        let objective = self.experiment.objective_value(index);
        info!(trial = index, objective = ?objective, "trial completed");
        self.strategy.observe(&trial, objective);
        Ok(())
    }

    fn check_failure_rate(&self) -> TlResult<()> {
        let failed = self.experiment.count_with_status(TrialStatus::Failed);
        if failed < self.options.min_failed_trials_for_failure_rate_check {
            return Ok(());
        }
        let finished = self.experiment.trials().iter().filter(|t| t.is_terminal()).count();
        let rate = failed as f64 / finished.max(1) as f64;
        if rate > self.options.tolerated_trial_failure_rate {
            return Err(TlError::FailureRateExceeded {
                failed,
                finished,
                tolerated: self.options.tolerated_trial_failure_rate,
            });
        }
        Ok(())
    }

    /// Re-report trials whose observations changed outside the loop.
    pub(crate) fn reobserve(&mut self, indices: &BTreeSet<TrialIndex>) -> TlResult<()> {
        for &index in indices {
            let trial = self.experiment.trial(index)?.clone();
            let objective = self.experiment.objective_value(index);
            self.strategy.observe(&trial, objective);
        }
        Ok(())
    }

    pub(crate) fn experiment_mut(&mut self) -> &mut Experiment {
        &mut self.experiment
    }

    // ---- snapshots ----

    pub fn save_snapshot(&self, path: &Path) -> TlResult<PathBuf> {
        snapshot::save(self, path)
    }

    pub(crate) fn save_snapshot_if_configured(&self) -> TlResult<()> {
        if let Some(path) = &self.options.snapshot_path {
            let written = snapshot::save(self, path)?;
            debug!(path = %written.display(), "snapshot saved");
        }
        Ok(())
    }

    // ---- reporting ----

    pub fn best_trial(&self) -> Option<BestTrial> {
        let (index, objective) = self.experiment.best_trial()?;
        let trial = self.experiment.trial(index).ok()?;
        let metrics = self
            .experiment
            .observations()
            .for_trial(index)
            .map(|o| (o.metric_name.clone(), o.mean))
            .collect();
        Some(BestTrial {
            index,
            objective,
            parameters: trial.parameters().ok()?.clone(),
            metrics,
        })
    }

    pub fn summary(&self) -> SchedulerSummary {
        SchedulerSummary {
            experiment: self.experiment.name.clone(),
            num_trials: self.experiment.num_trials(),
            status_counts: self.experiment.status_counts(),
            best_trial: self.best_trial(),
            generation_strategy: self.strategy.name().to_string(),
            stop_reason: self.stop_reason.clone(),
            snapshot_path: self.options.snapshot_path.clone(),
            fetch_cache: self.cache.stats(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tl_optimizer::{GenerationStep, ModelKind};
    use tl_runner::{FetchContext, MetricData, TrialData, Wrapper, WrapperDescriptor};
    use tl_types::{internal_error, MetricConfig, ObjectiveConfig, SearchSpace, StatusChange, Trial};

    /// Completes each trial on its second poll; trials whose `x` is in
    /// `fail_run` fail to launch, those in `fail_status` fail to report.
    #[derive(Default)]
    struct Quadratic {
        polls: Mutex<HashMap<TrialIndex, usize>>,
        fail_run: Vec<i64>,
        abandon: Vec<i64>,
    }

    fn x_of(trial: &Trial) -> i64 {
        match trial.parameters().ok().and_then(|p| p.get("x")) {
            Some(tl_types::ParameterValue::Int(x)) => *x,
            _ => 0,
        }
    }

    impl Wrapper for Quadratic {
        fn descriptor(&self) -> WrapperDescriptor {
            WrapperDescriptor::new("quadratic")
        }

        fn run_model(&self, trial: &Trial) -> TlResult<()> {
            if self.fail_run.contains(&x_of(trial)) {
                return Err(internal_error!("cannot launch x={}", x_of(trial)));
            }
            Ok(())
        }

        fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
            let mut polls = self.polls.lock();
            let count = polls.entry(trial.index).or_insert(0);
            *count += 1;
            if *count < 2 {
                return Ok(trial.mark_running());
            }
            if self.abandon.contains(&x_of(trial)) {
                return Ok(trial.mark_abandoned("gave up"));
            }
            Ok(trial.mark_completed())
        }

        fn fetch_trial_data(&self, trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
            let x = x_of(trial) as f64;
            Ok(TrialData::Single(MetricData::with_sem((x - 2.0).powi(2), 0.0)))
        }
    }

    fn grid_scheduler(wrapper: Quadratic, options: SchedulerOptions) -> Scheduler {
        let experiment = Experiment::new(
            "quadratic",
            SearchSpace::new().add_int("x", 0, 4),
            ObjectiveConfig::new(vec![MetricConfig::passthrough("loss")]),
        )
        .unwrap();
        let strategy = GenerationStrategy::new(vec![GenerationStep::new(ModelKind::Grid)]);
        Scheduler::new(experiment, strategy, Arc::new(wrapper), options.with_poll_interval(0.0, 1.0, 0.0)).unwrap()
    }

    #[test]
    fn runs_grid_to_exhaustion() {
        let mut scheduler = grid_scheduler(Quadratic::default(), SchedulerOptions::default().with_max_pending_trials(2));
        let summary = scheduler.run_all_trials().unwrap();

        assert_eq!(summary.num_trials, 5);
        assert_eq!(summary.count(TrialStatus::Completed), 5);
        assert_eq!(scheduler.experiment().observations().len(), 5);
        let best = summary.best_trial.unwrap();
        assert_eq!(best.index, 2);
        assert_eq!(best.metrics["loss"], 0.0);
        assert_eq!(summary.stop_reason.as_deref(), Some("generation strategy exhausted"));
        assert_eq!(scheduler.generation_strategy().observed().len(), 5);
    }

    #[test]
    fn run_n_trials_respects_budget_and_resumes() {
        let mut scheduler = grid_scheduler(Quadratic::default(), SchedulerOptions::default());
        let summary = scheduler.run_n_trials(2).unwrap();
        assert_eq!(summary.num_trials, 2);

        let summary = scheduler.run_n_trials(2).unwrap();
        assert_eq!(summary.num_trials, 4);
        let indices: Vec<_> = scheduler.experiment().trials().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn dispatch_failures_mark_trials_failed() {
        let wrapper = Quadratic {
            fail_run: vec![1],
            abandon: vec![3],
            ..Default::default()
        };
        let mut scheduler = grid_scheduler(wrapper, SchedulerOptions::default());
        let summary = scheduler.run_all_trials().unwrap();

        assert_eq!(summary.count(TrialStatus::Failed), 1);
        assert_eq!(summary.count(TrialStatus::Abandoned), 1);
        assert_eq!(summary.count(TrialStatus::Completed), 3);
        let failed = scheduler.experiment().trial(1).unwrap();
        assert!(failed.failure_reason.as_deref().unwrap().contains("cannot launch"));
        // abandoned and failed trials have no observation rows
        assert_eq!(scheduler.experiment().observations().len(), 3);
        assert_eq!(scheduler.generation_strategy().observed()[&1].objective, None);
    }

    #[test]
    fn failure_rate_aborts() {
        let wrapper = Quadratic {
            fail_run: vec![0, 1, 2],
            ..Default::default()
        };
        let options = SchedulerOptions::default().with_failure_rate_check(0.5, 2);
        let mut scheduler = grid_scheduler(wrapper, options);
        let err = scheduler.run_all_trials().unwrap_err();
        assert!(matches!(err, TlError::FailureRateExceeded { .. }));
    }

    #[test]
    fn batches_wait_for_running_trials() {
        let options = SchedulerOptions::default().with_max_pending_trials(2).with_batches(true);
        let mut scheduler = grid_scheduler(Quadratic::default(), options);
        scheduler.run_all_trials().unwrap();

        // trials of one batch are created together, so run start order follows batches
        let trials = scheduler.experiment().trials();
        assert!(trials[2].run_started_at >= trials[1].completed_at);
        assert!(trials[4].run_started_at >= trials[3].completed_at);
    }

    /// Never finishes a trial on its own.
    struct Stuck;

    impl Wrapper for Stuck {
        fn descriptor(&self) -> WrapperDescriptor {
            WrapperDescriptor::new("stuck")
        }

        fn run_model(&self, _trial: &Trial) -> TlResult<()> {
            Ok(())
        }

        fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
            Ok(trial.mark_running())
        }

        fn fetch_trial_data(&self, _trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
            Err(internal_error!("no data"))
        }
    }

    #[test]
    fn cancellation_abandons_running_trials() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.json");
        let experiment = Experiment::new(
            "stuck",
            SearchSpace::new().add_int("x", 0, 4),
            ObjectiveConfig::new(vec![MetricConfig::passthrough("loss")]),
        )
        .unwrap();
        let strategy = GenerationStrategy::new(vec![GenerationStep::new(ModelKind::Grid)]);
        let options = SchedulerOptions::default()
            .with_max_pending_trials(2)
            .with_poll_interval(5.0, 1.0, 5.0)
            .with_snapshot_path(&path);
        let mut scheduler = Scheduler::new(experiment, strategy, Arc::new(Stuck), options).unwrap();

        let flag = scheduler.cancel_flag();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let summary = scheduler.run_all_trials().unwrap();
        trigger.join().unwrap();

        // the five-second poll wait is cut short
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(summary.num_trials, 2);
        assert_eq!(summary.count(TrialStatus::Abandoned), 2);
        assert_eq!(summary.stop_reason.as_deref(), Some("cancelled"));
        let trial = scheduler.experiment().trial(0).unwrap();
        assert_eq!(trial.failure_reason.as_deref(), Some("interrupted"));
        assert_eq!(scheduler.generation_strategy().observed()[&1].objective, None);
        assert!(path.exists());
    }

    #[test]
    fn unbounded_runs_need_a_budget() {
        let experiment = Experiment::new(
            "open",
            SearchSpace::new().add_float("x", 0.0, 1.0),
            ObjectiveConfig::new(vec![MetricConfig::passthrough("loss")]),
        )
        .unwrap();
        let strategy = GenerationStrategy::new(vec![GenerationStep::new(ModelKind::Random)]);
        let mut scheduler = Scheduler::new(experiment, strategy, Arc::new(Quadratic::default()), SchedulerOptions::default()).unwrap();
        assert!(scheduler.run_all_trials().is_err());
    }
}
