//! The experiment ledger: trials, metrics and observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::{TlResult, TrialError};
use crate::metric::{MetricConfig, ObjectiveConfig, Observation, ObservationTable};
use crate::search_space::SearchSpace;
use crate::trial::{Parameters, Trial, TrialIndex, TrialStatus};
use crate::validation_error;

/// Unique experiment identifier.
pub type ExperimentId = Uuid;

/// Ordered trials, a metric registry and the accumulated observations.
///
/// Invariant: only terminal trials have observation rows, at most one per
/// metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub search_space: SearchSpace,
    metrics: Vec<MetricConfig>,
    trials: Vec<Trial>,
    observations: ObservationTable,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, search_space: SearchSpace, objective: ObjectiveConfig) -> TlResult<Self> {
        search_space.validate()?;
        objective.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            search_space,
            metrics: objective.metrics,
            trials: Vec::new(),
            observations: ObservationTable::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    // ---- metrics ----

    pub fn metrics(&self) -> &[MetricConfig] {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }

    // ---- trials ----

    /// Index the next trial will receive.
    pub fn next_trial_index(&self) -> TrialIndex {
        self.trials.len()
    }

    /// Create a candidate trial with the next index.
    pub fn new_trial(&mut self, parameters: Parameters, generation_step: impl Into<String>) -> &mut Trial {
        let index = self.next_trial_index();
        self.trials.push(Trial::new(index, parameters, generation_step));
        &mut self.trials[index]
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn trials_mut(&mut self) -> &mut [Trial] {
        &mut self.trials
    }

    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    pub fn trial(&self, index: TrialIndex) -> TlResult<&Trial> {
        self.trials
            .get(index)
            .ok_or_else(|| TrialError::NotFound { index }.into())
    }

    pub fn trial_mut(&mut self, index: TrialIndex) -> TlResult<&mut Trial> {
        self.trials
            .get_mut(index)
            .ok_or_else(|| TrialError::NotFound { index }.into())
    }

    pub fn trial_indices_with_status(&self, status: TrialStatus) -> Vec<TrialIndex> {
        self.trials
            .iter()
            .filter(|t| t.status() == status)
            .map(|t| t.index)
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<TrialStatus, usize> {
        let mut counts = BTreeMap::new();
        for trial in &self.trials {
            *counts.entry(trial.status()).or_insert(0) += 1;
        }
        counts
    }

    pub fn count_with_status(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status() == status).count()
    }

    // ---- observations ----

    pub fn observations(&self) -> &ObservationTable {
        &self.observations
    }

    /// Attach one observation row, superseding any previous row for the cell.
    pub fn attach_observation(&mut self, observation: Observation) -> TlResult<Option<Observation>> {
        let trial = self.trial(observation.trial_index)?;
        if !trial.is_terminal() {
            return Err(TrialError::NotTerminal {
                index: trial.index,
                status: trial.status().to_string(),
            }
            .into());
        }
        if self.metric(&observation.metric_name).is_none() {
            return Err(validation_error!(
                "observation for unknown metric `{}`",
                observation.metric_name
            ));
        }
        Ok(self.observations.insert(observation))
    }

    /// Scalarised objective of a trial, higher is better.
    ///
    /// Weighted sum of direction-signed means over non-info-only metrics.
    /// `None` while any of those cells is missing or NaN.
    pub fn objective_value(&self, trial_index: TrialIndex) -> Option<f64> {
        let mut total = 0.0;
        for metric in self.metrics.iter().filter(|m| !m.info_only) {
            let obs = self.observations.get(trial_index, &metric.name)?;
            if obs.mean.is_nan() {
                return None;
            }
            total += metric.weight * metric.direction().sign() * obs.mean;
        }
        Some(total)
    }

    /// Completed trial with the best scalarised objective.
    pub fn best_trial(&self) -> Option<(TrialIndex, f64)> {
        self.trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Completed)
            .filter_map(|t| self.objective_value(t.index).map(|v| (t.index, v)))
            .fold(None, |best: Option<(TrialIndex, f64)>, candidate| match best {
                Some(current) if current.1 >= candidate.1 => Some(current),
                _ => Some(candidate),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_space::ParameterValue;

    fn sample_experiment() -> Experiment {
        let space = SearchSpace::new().add_float("x0", -5.0, 10.0).add_float("x1", -5.0, 10.0);
        let objective = ObjectiveConfig::new(vec![
            MetricConfig::passthrough("loss"),
            MetricConfig::passthrough("runtime").info_only(),
        ]);
        Experiment::new("unit", space, objective).unwrap()
    }

    fn params(x: f64) -> Parameters {
        let mut p = Parameters::new();
        p.insert("x0".into(), ParameterValue::Float(x));
        p.insert("x1".into(), ParameterValue::Float(x));
        p
    }

    #[test]
    fn trial_indices_are_monotonic() {
        let mut exp = sample_experiment();
        for i in 0..3 {
            let trial = exp.new_trial(params(i as f64), "random");
            assert_eq!(trial.index, i);
        }
        assert_eq!(exp.next_trial_index(), 3);
    }

    #[test]
    fn observations_require_terminal_trials() {
        let mut exp = sample_experiment();
        exp.new_trial(params(1.0), "random").mark_running();

        let obs = Observation::new(0, "loss", 1.0, 0.0);
        assert!(exp.attach_observation(obs.clone()).is_err());

        exp.trial_mut(0).unwrap().mark_completed();
        exp.attach_observation(obs).unwrap();
        assert_eq!(exp.observations().len(), 1);

        let unknown = Observation::new(0, "accuracy", 1.0, 0.0);
        assert!(exp.attach_observation(unknown).is_err());
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let mut exp = sample_experiment();
        for (i, loss) in [3.0, 1.0, 2.0].into_iter().enumerate() {
            let trial = exp.new_trial(params(i as f64), "random");
            trial.mark_running();
            trial.mark_completed();
            exp.attach_observation(Observation::new(i, "loss", loss, 0.0)).unwrap();
            exp.attach_observation(Observation::new(i, "runtime", 100.0, 0.0)).unwrap();
        }

        assert_eq!(exp.best_trial(), Some((1, -1.0)));
    }

    #[test]
    fn pending_observations_have_no_objective() {
        let mut exp = sample_experiment();
        let trial = exp.new_trial(params(0.0), "random");
        trial.mark_running();
        trial.mark_completed();
        exp.attach_observation(Observation::new(0, "loss", f64::NAN, f64::NAN)).unwrap();

        assert_eq!(exp.objective_value(0), None);
        assert_eq!(exp.best_trial(), None);
    }

    #[test]
    fn status_counts() {
        let mut exp = sample_experiment();
        exp.new_trial(params(0.0), "random").mark_running();
        let t = exp.new_trial(params(1.0), "random");
        t.mark_running();
        t.mark_failed("boom");

        let counts = exp.status_counts();
        assert_eq!(counts.get(&TrialStatus::Running), Some(&1));
        assert_eq!(counts.get(&TrialStatus::Failed), Some(&1));
        assert_eq!(exp.trial_indices_with_status(TrialStatus::Running), vec![0]);
    }
}
