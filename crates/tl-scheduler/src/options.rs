use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tl_types::{config_error, ConfigError, TlResult};

use crate::stopping::GlobalStoppingConfig;

/// The `scheduler` section of the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Trials to add in one `run_all_trials` call.
    pub n_trials: Option<usize>,
    /// Total trial count the experiment should reach.
    pub total_trials: Option<usize>,
    pub max_pending_trials: usize,
    pub tolerated_trial_failure_rate: f64,
    pub min_failed_trials_for_failure_rate_check: usize,
    pub init_seconds_between_polls: f64,
    pub seconds_between_polls_backoff_factor: f64,
    pub max_seconds_between_polls: f64,
    /// Wait for every running trial before generating the next batch.
    pub run_trials_in_batches: bool,
    pub global_stopping: Option<GlobalStoppingConfig>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            n_trials: None,
            total_trials: None,
            max_pending_trials: 10,
            tolerated_trial_failure_rate: 0.5,
            min_failed_trials_for_failure_rate_check: 5,
            init_seconds_between_polls: 1.0,
            seconds_between_polls_backoff_factor: 1.5,
            max_seconds_between_polls: 30.0,
            run_trials_in_batches: false,
            global_stopping: None,
            snapshot_path: None,
        }
    }
}

impl SchedulerOptions {
    pub fn with_n_trials(mut self, n: usize) -> Self {
        self.n_trials = Some(n);
        self
    }

    pub fn with_total_trials(mut self, n: usize) -> Self {
        self.total_trials = Some(n);
        self
    }

    pub fn with_max_pending_trials(mut self, n: usize) -> Self {
        self.max_pending_trials = n;
        self
    }

    pub fn with_failure_rate_check(mut self, tolerated_rate: f64, min_failed: usize) -> Self {
        self.tolerated_trial_failure_rate = tolerated_rate;
        self.min_failed_trials_for_failure_rate_check = min_failed;
        self
    }

    pub fn with_poll_interval(mut self, init_seconds: f64, backoff_factor: f64, max_seconds: f64) -> Self {
        self.init_seconds_between_polls = init_seconds;
        self.seconds_between_polls_backoff_factor = backoff_factor;
        self.max_seconds_between_polls = max_seconds;
        self
    }

    pub fn with_batches(mut self, in_batches: bool) -> Self {
        self.run_trials_in_batches = in_batches;
        self
    }

    pub fn with_global_stopping(mut self, config: GlobalStoppingConfig) -> Self {
        self.global_stopping = Some(config);
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.n_trials.is_some() && self.total_trials.is_some() {
            return Err(ConfigError::MutuallyExclusive {
                first: "n_trials".to_string(),
                second: "total_trials".to_string(),
            }
            .into());
        }
        if self.max_pending_trials == 0 {
            return Err(config_error!("max_pending_trials must be positive"));
        }
        if !(0.0..=1.0).contains(&self.tolerated_trial_failure_rate) {
            return Err(config_error!(
                "tolerated_trial_failure_rate must be within [0, 1], got {}",
                self.tolerated_trial_failure_rate
            ));
        }
        for (name, value) in [
            ("init_seconds_between_polls", self.init_seconds_between_polls),
            ("max_seconds_between_polls", self.max_seconds_between_polls),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(config_error!("{name} must be a non-negative number, got {value}"));
            }
        }
        if !(self.seconds_between_polls_backoff_factor.is_finite() && self.seconds_between_polls_backoff_factor >= 1.0) {
            return Err(config_error!(
                "seconds_between_polls_backoff_factor must be at least 1, got {}",
                self.seconds_between_polls_backoff_factor
            ));
        }
        if self.max_seconds_between_polls < self.init_seconds_between_polls {
            return Err(config_error!(
                "max_seconds_between_polls ({}) is below init_seconds_between_polls ({})",
                self.max_seconds_between_polls,
                self.init_seconds_between_polls
            ));
        }
        if let Some(stopping) = &self.global_stopping {
            stopping.validate()?;
        }
        Ok(())
    }
}

/// Poll cadence: starts at the initial interval, grows by the backoff factor
/// while nothing changes, resets on change.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    init: f64,
    factor: f64,
    max: f64,
    current: f64,
}

impl PollBackoff {
    pub fn new(options: &SchedulerOptions) -> Self {
        Self {
            init: options.init_seconds_between_polls,
            factor: options.seconds_between_polls_backoff_factor,
            max: options.max_seconds_between_polls,
            current: options.init_seconds_between_polls,
        }
    }

    /// Interval to wait now, given whether the last pass changed anything.
    pub fn next(&mut self, changed: bool) -> Duration {
        if changed {
            self.current = self.init;
        }
        let wait = self.current;
        self.current = (self.current * self.factor).min(self.max);
        Duration::from_secs_f64(wait)
    }
}
