//! Step-wise generation strategy: a sequence of search models, each with a
//! trial budget, whose progress serialises into the snapshot.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use tl_types::{config_error, ConfigError, Experiment, Parameters, SearchSpace, TlResult, Trial, TrialIndex};

use crate::engine::{Candidate, OptimizerEngine};
use crate::search::{BayesianSearch, GridSearch, RandomSearch, SearchStrategy};

pub const DEFAULT_INITIALIZATION_TRIALS: usize = 5;
pub const DEFAULT_EXPLORATION_WEIGHT: f64 = 0.2;
pub const DEFAULT_GRID_STEPS: usize = 5;

/// Search model used by a generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[serde(alias = "sobol", alias = "uniform")]
    Random,
    Grid,
    #[serde(alias = "gpei", alias = "botorch")]
    Bayesian,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Grid => "grid",
            Self::Bayesian => "bayesian",
        }
    }
}

/// Negative budgets (`-1`) mean "unlimited".
fn deserialize_budget<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| usize::try_from(v).ok()))
}

fn default_exploration_weight() -> f64 {
    DEFAULT_EXPLORATION_WEIGHT
}

fn default_grid_steps() -> usize {
    DEFAULT_GRID_STEPS
}

/// One phase of the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub model: ModelKind,
    /// Trials this step generates before handing over; `None` is unlimited.
    #[serde(default, deserialize_with = "deserialize_budget")]
    pub num_trials: Option<usize>,
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,
    /// Points per continuous axis for grid steps.
    #[serde(default = "default_grid_steps")]
    pub grid_steps: usize,
}

impl GenerationStep {
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            num_trials: None,
            max_parallelism: None,
            exploration_weight: DEFAULT_EXPLORATION_WEIGHT,
            grid_steps: DEFAULT_GRID_STEPS,
        }
    }

    pub fn with_num_trials(mut self, num_trials: usize) -> Self {
        self.num_trials = Some(num_trials);
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: Option<usize>) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn with_grid_steps(mut self, grid_steps: usize) -> Self {
        self.grid_steps = grid_steps;
        self
    }
}

/// The `generation_strategy` section of the configuration document: either
/// explicit `steps` or the automatic options, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationStrategyConfig {
    pub name: Option<String>,
    pub steps: Vec<GenerationStep>,
    pub num_initialization_trials: Option<usize>,
    pub exploration_weight: Option<f64>,
    pub max_parallelism: Option<usize>,
}

impl GenerationStrategyConfig {
    pub fn validate(&self) -> TlResult<()> {
        if !self.steps.is_empty() {
            for option in [
                ("num_initialization_trials", self.num_initialization_trials.is_some()),
                ("exploration_weight", self.exploration_weight.is_some()),
            ] {
                if option.1 {
                    return Err(ConfigError::MutuallyExclusive {
                        first: "steps".to_string(),
                        second: option.0.to_string(),
                    }
                    .into());
                }
            }
        }

        let steps = self.resolved_steps();
        for (idx, step) in steps.iter().enumerate() {
            if !(0.0..=1.0).contains(&step.exploration_weight) {
                return Err(config_error!(
                    "generation step {idx}: exploration_weight must be within [0, 1], got {}",
                    step.exploration_weight
                ));
            }
            if step.num_trials.is_none() && idx + 1 < steps.len() {
                return Err(config_error!(
                    "generation step {idx}: only the last step may have an unlimited trial budget"
                ));
            }
            if step.max_parallelism == Some(0) {
                return Err(config_error!("generation step {idx}: max_parallelism must be positive"));
            }
        }
        Ok(())
    }

    /// Explicit steps, or `random(num_initialization_trials)` followed by an
    /// unlimited bayesian step.
    pub fn resolved_steps(&self) -> Vec<GenerationStep> {
        if !self.steps.is_empty() {
            return self.steps.clone();
        }

        let init = self.num_initialization_trials.unwrap_or(DEFAULT_INITIALIZATION_TRIALS);
        let weight = self.exploration_weight.unwrap_or(DEFAULT_EXPLORATION_WEIGHT);
        let mut steps = Vec::with_capacity(2);
        if init > 0 {
            steps.push(
                GenerationStep::new(ModelKind::Random)
                    .with_num_trials(init)
                    .with_max_parallelism(self.max_parallelism),
            );
        }
        steps.push(
            GenerationStep::new(ModelKind::Bayesian)
                .with_exploration_weight(weight)
                .with_max_parallelism(self.max_parallelism),
        );
        steps
    }
}

/// Result the strategy remembers for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPoint {
    pub parameters: Parameters,
    /// `None` for trials that finished without usable data.
    pub objective: Option<f64>,
}

/// Built-in optimizer engine.
///
/// All progress (current step, per-step counts, observed points) is plain
/// data so a restored strategy continues where the saved one stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStrategy {
    name: String,
    steps: Vec<GenerationStep>,
    current_step: usize,
    generated: Vec<usize>,
    observed: BTreeMap<TrialIndex, ObservedPoint>,
}

impl GenerationStrategy {
    pub fn new(steps: Vec<GenerationStep>) -> Self {
        let name = steps.iter().map(|s| s.model.name()).collect::<Vec<_>>().join("+");
        let generated = vec![0; steps.len()];
        Self {
            name,
            steps,
            current_step: 0,
            generated,
            observed: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &GenerationStrategyConfig) -> TlResult<Self> {
        config.validate()?;
        let mut strategy = Self::new(config.resolved_steps());
        if let Some(name) = &config.name {
            strategy.name = name.clone();
        }
        Ok(strategy)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[GenerationStep] {
        &self.steps
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step
    }

    pub fn current_step(&self) -> Option<&GenerationStep> {
        self.steps.get(self.current_step)
    }

    pub fn num_generated(&self) -> usize {
        self.generated.iter().sum()
    }

    pub fn observed(&self) -> &BTreeMap<TrialIndex, ObservedPoint> {
        &self.observed
    }

    /// Whether the strategy finishes on its own: every step has a budget or
    /// walks a finite grid.
    pub fn is_bounded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.num_trials.is_some() || s.model == ModelKind::Grid)
    }

    fn advance(&mut self) {
        self.current_step += 1;
        match self.current_step() {
            Some(step) => info!(
                strategy = %self.name,
                step = self.current_step,
                model = step.model.name(),
                "advancing to next generation step"
            ),
            None => info!(strategy = %self.name, "generation strategy exhausted"),
        }
    }

    fn suggest(&self, step: &GenerationStep, cursor: usize, count: usize, space: &SearchSpace) -> Vec<Parameters> {
        match step.model {
            ModelKind::Random => RandomSearch::new(space.clone()).suggest(count),
            ModelKind::Grid => GridSearch::new(space, step.grid_steps).resume_at(cursor).suggest(count),
            ModelKind::Bayesian => {
                let mut search = BayesianSearch::new(space.clone(), step.exploration_weight);
                for point in self.observed.values() {
                    if let Some(objective) = point.objective {
                        search.report(&point.parameters, objective);
                    }
                }
                search.suggest(count)
            }
        }
    }
}

impl OptimizerEngine for GenerationStrategy {
    fn generate(&mut self, n: usize, experiment: &Experiment) -> TlResult<Vec<Candidate>> {
        let mut candidates = Vec::with_capacity(n);

        while candidates.len() < n {
            let idx = self.current_step;
            let Some(step) = self.steps.get(idx).cloned() else {
                break;
            };

            let cursor = self.generated[idx];
            let wanted = n - candidates.len();
            let wanted = match step.num_trials {
                Some(budget) if cursor >= budget => {
                    self.advance();
                    continue;
                }
                Some(budget) => wanted.min(budget - cursor),
                None => wanted,
            };

            let batch = self.suggest(&step, cursor, wanted, &experiment.search_space);
            if batch.is_empty() {
                debug!(step = idx, model = step.model.name(), "generation step produced nothing");
                self.advance();
                continue;
            }

            self.generated[idx] += batch.len();
            candidates.extend(batch.into_iter().map(|p| Candidate::new(p, step.model.name())));
        }

        debug!(strategy = %self.name, requested = n, generated = candidates.len(), "generated candidates");
        Ok(candidates)
    }

    fn observe(&mut self, trial: &Trial, objective: Option<f64>) {
        let Ok(parameters) = trial.parameters() else {
            return;
        };
        let objective = objective.filter(|v| v.is_finite());
        self.observed.insert(
            trial.index,
            ObservedPoint {
                parameters: parameters.clone(),
                objective,
            },
        );
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    fn max_parallelism(&self) -> Option<usize> {
        self.current_step().and_then(|s| s.max_parallelism)
    }
}
