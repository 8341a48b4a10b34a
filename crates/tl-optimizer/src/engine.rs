//! The interface the scheduler drives.

use serde::{Deserialize, Serialize};
use tl_types::{Experiment, Parameters, TlResult, Trial};

/// A parameter set proposed by an engine, tagged with the step that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub parameters: Parameters,
    pub generation_step: String,
}

impl Candidate {
    pub fn new(parameters: Parameters, generation_step: impl Into<String>) -> Self {
        Self {
            parameters,
            generation_step: generation_step.into(),
        }
    }
}

/// Optimizer engine seen by the scheduling loop.
///
/// `observe` receives the trial's scalarised objective (higher is better),
/// or `None` when the trial finished without usable data (failed,
/// abandoned, early stopped or still pending backfill). A trial may be
/// observed more than once; later reports supersede earlier ones.
pub trait OptimizerEngine: Send {
    /// Propose up to `n` candidates. Returning fewer means the engine is
    /// running out of points or its current step limits parallelism.
    fn generate(&mut self, n: usize, experiment: &Experiment) -> TlResult<Vec<Candidate>>;

    fn observe(&mut self, trial: &Trial, objective: Option<f64>);

    /// No further candidates will ever be produced.
    fn is_done(&self) -> bool;

    /// Concurrency cap imposed by the engine's current phase.
    fn max_parallelism(&self) -> Option<usize> {
        None
    }
}
