//! Improvement-based global stopping.

use serde::{Deserialize, Serialize};

use tl_types::{config_error, Experiment, TlResult, TrialStatus};

/// Stop once the best objective has improved by less than `improvement_bar`
/// (relative) over the last `window_size` completed trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStoppingConfig {
    /// Completed trials required before the rule is consulted.
    pub min_trials: usize,
    pub window_size: usize,
    pub improvement_bar: f64,
}

impl Default for GlobalStoppingConfig {
    fn default() -> Self {
        Self {
            min_trials: 5,
            window_size: 5,
            improvement_bar: 0.1,
        }
    }
}

impl GlobalStoppingConfig {
    pub fn validate(&self) -> TlResult<()> {
        if self.window_size == 0 {
            return Err(config_error!("global_stopping.window_size must be positive"));
        }
        if !(self.improvement_bar.is_finite() && self.improvement_bar >= 0.0) {
            return Err(config_error!(
                "global_stopping.improvement_bar must be a non-negative number, got {}",
                self.improvement_bar
            ));
        }
        Ok(())
    }

    /// A human-readable reason when the experiment should stop.
    pub fn should_stop(&self, experiment: &Experiment) -> Option<String> {
        let objectives: Vec<f64> = experiment
            .trials()
            .iter()
            .filter(|t| t.status() == TrialStatus::Completed)
            .filter_map(|t| experiment.objective_value(t.index))
            .collect();

        if objectives.len() < self.min_trials.max(self.window_size + 1) {
            return None;
        }

        // best-so-far trajectory
        let mut best = Vec::with_capacity(objectives.len());
        for value in &objectives {
            let next = best.last().map_or(*value, |b: &f64| b.max(*value));
            best.push(next);
        }

        let now = best[best.len() - 1];
        let before = best[best.len() - 1 - self.window_size];
        let improvement = if before == 0.0 {
            (now - before).abs()
        } else {
            (now - before) / before.abs()
        };

        (improvement < self.improvement_bar).then(|| {
            format!(
                "best objective improved by {improvement:.4} over the last {} trials (bar {})",
                self.window_size, self.improvement_bar
            )
        })
    }
}
