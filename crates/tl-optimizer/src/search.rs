//! Parameter sweep strategies used by the generation steps.

use rand::Rng;
use tl_types::{ParameterDef, ParameterKind, ParameterValue, Parameters, SearchSpace};

/// Common trait for all search strategies.
pub trait SearchStrategy {
    /// Generate the next batch of parameter combinations to evaluate.
    fn suggest(&mut self, count: usize) -> Vec<Parameters>;

    /// Report completed trial results so adaptive strategies can learn.
    /// Objectives are "higher is better".
    fn report(&mut self, _params: &Parameters, _objective: f64) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn sample_value(rng: &mut impl Rng, kind: &ParameterKind) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => values[rng.random_range(0..values.len())].clone(),
        ParameterKind::Fixed { value } => value.clone(),
    }
}

// ---- Grid search ----

/// Exhaustive grid search over discrete parameter combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<Parameters>,
}

impl GridSearch {
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            cursor: 0,
            combos: Self::build_grid(space, float_steps),
        }
    }

    /// Skip combinations that were already handed out.
    pub fn resume_at(mut self, cursor: usize) -> Self {
        self.cursor = cursor.min(self.combos.len());
        self
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn axis(param: &ParameterDef, float_steps: usize) -> Vec<ParameterValue> {
        let steps = float_steps.max(2);
        match &param.kind {
            ParameterKind::FloatRange { low, high } => (0..steps)
                .map(|i| {
                    let t = i as f64 / (steps - 1) as f64;
                    ParameterValue::Float(low + t * (high - low))
                })
                .collect(),
            ParameterKind::IntRange { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
            ParameterKind::LogUniform { low, high } => {
                let (log_low, log_high) = (low.ln(), high.ln());
                (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                    })
                    .collect()
            }
            ParameterKind::Choice { values } => values.clone(),
            ParameterKind::Fixed { value } => vec![value.clone()],
        }
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<Parameters> {
        // Cartesian product
        let mut result: Vec<Parameters> = vec![Parameters::new()];
        for param in &space.parameters {
            let axis = Self::axis(param, float_steps);
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.insert(param.name.clone(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<Parameters> {
        let end = (self.cursor + count).min(self.combos.len());
        let batch = self.combos[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self { space }
    }

    fn sample_one(&self) -> Parameters {
        let mut rng = rand::rng();
        self.space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_value(&mut rng, &param.kind)))
            .collect()
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Parameters> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (surrogate-model stub) ----

/// Bayesian-flavoured search using a simple surrogate heuristic.
///
/// Tracks observed (params, objective) pairs and biases sampling toward the
/// best region seen so far. With probability `exploration_weight` a point is
/// drawn uniformly instead.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    observations: Vec<(Parameters, f64)>,
    exploration_weight: f64,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, exploration_weight: f64) -> Self {
        Self {
            space,
            observations: Vec::new(),
            exploration_weight,
        }
    }

    /// Pure exploration sample (same as random).
    fn explore(&self) -> Parameters {
        RandomSearch::new(self.space.clone()).sample_one()
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&self) -> Parameters {
        let best = self
            .observations
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let base = match best {
            Some((params, _)) => params,
            None => return self.explore(),
        };

        let mut rng = rand::rng();
        let mut perturbed = Parameters::new();

        for param in &self.space.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.random_range(-0.1_f64..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.random_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = rng.random_range(-0.1_f64..0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                // Fall back to random for choices or missing base
                (kind, _) => sample_value(&mut rng, kind),
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

impl SearchStrategy for BayesianSearch {
    fn suggest(&mut self, count: usize) -> Vec<Parameters> {
        let mut rng = rand::rng();
        (0..count)
            .map(|_| {
                if self.observations.is_empty() || rng.random::<f64>() < self.exploration_weight {
                    self.explore()
                } else {
                    self.exploit()
                }
            })
            .collect()
    }

    fn report(&mut self, params: &Parameters, objective: f64) {
        self.observations.push((params.clone(), objective));
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
