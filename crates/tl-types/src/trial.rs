//! Trials and the trial status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::errors::{TlResult, TrialError};
use crate::search_space::ParameterValue;

/// Monotonic trial index, assigned at creation and never reused.
pub type TrialIndex = usize;

/// Parameter assignment of a single arm.
pub type Parameters = BTreeMap<String, ParameterValue>;

/// Opaque metadata returned by the job runner when a trial is dispatched.
pub type RunMetadata = serde_json::Map<String, Value>;

/// Lifecycle state of a trial.
///
/// `Candidate → Running → {Completed, Failed, Abandoned, EarlyStopped}`.
/// The integer codes are the ones external status files may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Candidate,
    Running,
    Completed,
    Failed,
    Abandoned,
    EarlyStopped,
}

impl TrialStatus {
    pub const ALL: [TrialStatus; 6] = [
        TrialStatus::Candidate,
        TrialStatus::Running,
        TrialStatus::Completed,
        TrialStatus::Failed,
        TrialStatus::Abandoned,
        TrialStatus::EarlyStopped,
    ];

    pub const TERMINAL: [TrialStatus; 4] = [
        TrialStatus::Completed,
        TrialStatus::Failed,
        TrialStatus::Abandoned,
        TrialStatus::EarlyStopped,
    ];

    pub fn code(self) -> i64 {
        match self {
            TrialStatus::Candidate => 0,
            TrialStatus::Failed => 2,
            TrialStatus::Completed => 3,
            TrialStatus::Running => 4,
            TrialStatus::Abandoned => 5,
            TrialStatus::EarlyStopped => 7,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            TrialStatus::Candidate => "CANDIDATE",
            TrialStatus::Running => "RUNNING",
            TrialStatus::Completed => "COMPLETED",
            TrialStatus::Failed => "FAILED",
            TrialStatus::Abandoned => "ABANDONED",
            TrialStatus::EarlyStopped => "EARLY_STOPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Parse a status token written by an out-of-process mechanism.
    ///
    /// Integer coercion is tried first, then a case-insensitive name lookup
    /// that ignores `_`, `-` and spaces. A single-element list is unwrapped.
    /// Anything else is an error: an unrecognized token would otherwise leave
    /// the trial running forever.
    pub fn parse_token(token: &Value) -> TlResult<Self> {
        match token {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .and_then(Self::from_code)
                .ok_or_else(|| unknown_status(token)),
            Value::String(s) => Self::parse_str(s),
            Value::Array(items) if items.len() == 1 => Self::parse_token(&items[0]),
            _ => Err(unknown_status(token)),
        }
    }

    pub fn parse_str(token: &str) -> TlResult<Self> {
        let trimmed = token.trim();
        if let Ok(code) = trimmed.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| {
                TrialError::UnknownStatus {
                    token: token.to_string(),
                }
                .into()
            });
        }

        let normalized: String = trimmed
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        Self::ALL
            .into_iter()
            .find(|status| status.name().replace('_', "").to_lowercase() == normalized)
            .ok_or_else(|| {
                TrialError::UnknownStatus {
                    token: token.to_string(),
                }
                .into()
            })
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn unknown_status(token: &Value) -> crate::errors::TlError {
    TrialError::UnknownStatus {
        token: token.to_string(),
    }
    .into()
}

/// Outcome of a requested status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Changed { from: TrialStatus, to: TrialStatus },
    Unchanged(TrialStatus),
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        matches!(self, StatusChange::Changed { .. })
    }
}

/// The specific parameter values evaluated within a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub name: String,
    pub parameters: Parameters,
}

impl Arm {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// One proposed parameter assignment under evaluation.
///
/// The status is only reachable through the `mark_*` methods so that terminal
/// states stay terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: TrialIndex,
    pub arms: Vec<Arm>,
    status: TrialStatus,
    /// Which generation step produced the candidate.
    pub generation_step: String,
    #[serde(default)]
    pub run_metadata: RunMetadata,
    pub created_at: DateTime<Utc>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Trial {
    pub fn new(index: TrialIndex, parameters: Parameters, generation_step: impl Into<String>) -> Self {
        Self::batch(
            index,
            vec![Arm::new(format!("{index}_0"), parameters)],
            generation_step,
        )
    }

    /// A multi-arm trial. The runner rejects these; they exist so that
    /// externally created ledgers can still be loaded and inspected.
    pub fn batch(index: TrialIndex, arms: Vec<Arm>, generation_step: impl Into<String>) -> Self {
        Self {
            index,
            arms,
            status: TrialStatus::Candidate,
            generation_step: generation_step.into(),
            run_metadata: RunMetadata::new(),
            created_at: Utc::now(),
            run_started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The only arm of a single-arm trial.
    pub fn single_arm(&self) -> TlResult<&Arm> {
        match self.arms.as_slice() {
            [arm] => Ok(arm),
            arms => Err(TrialError::UnsupportedBatchTrial {
                index: self.index,
                arms: arms.len(),
            }
            .into()),
        }
    }

    pub fn parameters(&self) -> TlResult<&Parameters> {
        Ok(&self.single_arm()?.parameters)
    }

    pub fn mark_running(&mut self) -> StatusChange {
        self.transition(TrialStatus::Running, None)
    }

    pub fn mark_completed(&mut self) -> StatusChange {
        self.transition(TrialStatus::Completed, None)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> StatusChange {
        self.transition(TrialStatus::Failed, Some(reason.into()))
    }

    pub fn mark_abandoned(&mut self, reason: impl Into<String>) -> StatusChange {
        self.transition(TrialStatus::Abandoned, Some(reason.into()))
    }

    pub fn mark_early_stopped(&mut self) -> StatusChange {
        self.transition(TrialStatus::EarlyStopped, None)
    }

    /// Apply a status transition.
    ///
    /// Terminal states never change again, `Running → Running` is a no-op and
    /// a running trial cannot go back to `Candidate`. Only a `Running` trial
    /// may reach a terminal state.
    pub fn transition(&mut self, to: TrialStatus, reason: Option<String>) -> StatusChange {
        let from = self.status;

        if from == to {
            return StatusChange::Unchanged(from);
        }

        if from.is_terminal() {
            warn!(
                trial = self.index,
                current = %from,
                requested = %to,
                "ignoring status change on terminal trial"
            );
            return StatusChange::Unchanged(from);
        }

        if to == TrialStatus::Candidate {
            debug!(trial = self.index, current = %from, "trial cannot return to candidate");
            return StatusChange::Unchanged(from);
        }

        if to.is_terminal() && from != TrialStatus::Running {
            warn!(
                trial = self.index,
                current = %from,
                requested = %to,
                "only running trials can finish"
            );
            return StatusChange::Unchanged(from);
        }

        let now = Utc::now();
        if to == TrialStatus::Running {
            self.run_started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.failure_reason = reason;
        }
        self.status = to;

        debug!(trial = self.index, from = %from, to = %to, "trial status changed");
        StatusChange::Changed { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_trial(index: TrialIndex) -> Trial {
        let mut params = Parameters::new();
        params.insert("x0".into(), ParameterValue::Float(1.5));
        Trial::new(index, params, "random")
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = sample_trial(0);
        assert_eq!(trial.status(), TrialStatus::Candidate);

        assert!(trial.mark_running().changed());
        assert_eq!(trial.status(), TrialStatus::Running);
        assert!(trial.run_started_at.is_some());

        assert_eq!(trial.mark_running(), StatusChange::Unchanged(TrialStatus::Running));

        trial.mark_completed();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(trial.completed_at.is_some());
    }

    #[test]
    fn trial_failure_records_reason() {
        let mut trial = sample_trial(1);
        trial.mark_running();
        trial.mark_failed("model exited with status 1");
        assert_eq!(trial.status(), TrialStatus::Failed);
        assert_eq!(trial.failure_reason.as_deref(), Some("model exited with status 1"));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut trial = sample_trial(2);
        trial.mark_running();
        trial.mark_completed();

        assert_eq!(
            trial.mark_failed("late failure"),
            StatusChange::Unchanged(TrialStatus::Completed)
        );
        assert_eq!(trial.mark_running(), StatusChange::Unchanged(TrialStatus::Completed));
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(trial.failure_reason.is_none());
    }

    #[test]
    fn candidates_cannot_skip_running() {
        let mut trial = sample_trial(3);
        assert_eq!(trial.mark_completed(), StatusChange::Unchanged(TrialStatus::Candidate));
        assert_eq!(trial.mark_failed("never ran"), StatusChange::Unchanged(TrialStatus::Candidate));
        assert_eq!(trial.status(), TrialStatus::Candidate);
        assert!(trial.completed_at.is_none());
        assert!(trial.failure_reason.is_none());

        trial.mark_running();
        assert!(trial.mark_completed().changed());
    }

    #[test]
    fn batch_trials_are_rejected() {
        let arm = Arm {
            name: "3_0".into(),
            parameters: Parameters::new(),
        };
        let trial = Trial::batch(3, vec![arm.clone(), arm], "manual");
        let err = trial.single_arm().unwrap_err();
        assert!(err.to_string().contains("2 arms"));
    }

    #[test]
    fn status_tokens_parse() {
        assert_eq!(TrialStatus::parse_token(&json!(3)).unwrap(), TrialStatus::Completed);
        assert_eq!(TrialStatus::parse_token(&json!("3")).unwrap(), TrialStatus::Completed);
        assert_eq!(TrialStatus::parse_token(&json!("failed")).unwrap(), TrialStatus::Failed);
        assert_eq!(
            TrialStatus::parse_token(&json!("Early-Stopped")).unwrap(),
            TrialStatus::EarlyStopped
        );
        assert_eq!(
            TrialStatus::parse_token(&json!(["abandoned"])).unwrap(),
            TrialStatus::Abandoned
        );
        assert_eq!(TrialStatus::parse_token(&json!([4])).unwrap(), TrialStatus::Running);
    }

    #[test]
    fn unknown_status_tokens_fail() {
        assert!(TrialStatus::parse_token(&json!("BOGUS")).is_err());
        assert!(TrialStatus::parse_token(&json!(99)).is_err());
        assert!(TrialStatus::parse_token(&json!(["a", "b"])).is_err());
        assert!(TrialStatus::parse_token(&json!({"status": 3})).is_err());
    }

    #[test]
    fn status_codes_round_trip() {
        for status in TrialStatus::ALL {
            assert_eq!(TrialStatus::from_code(status.code()), Some(status));
            assert_eq!(TrialStatus::parse_str(status.name()).unwrap(), status);
        }
    }

    #[test]
    fn trial_serialization_keeps_status() {
        let mut trial = sample_trial(4);
        trial.mark_running();
        trial.mark_abandoned("stale");

        let json = serde_json::to_string(&trial).unwrap();
        assert!(json.contains("\"ABANDONED\""));
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(trial, back);
    }

    fn any_status() -> impl Strategy<Value = TrialStatus> {
        prop::sample::select(TrialStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_terminal_transition_is_idempotent(
            terminal in prop::sample::select(TrialStatus::TERMINAL.to_vec()),
            later in prop::collection::vec(any_status(), 0..8),
        ) {
            let mut trial = sample_trial(7);
            trial.mark_running();
            trial.transition(terminal, None);
            prop_assert_eq!(trial.status(), terminal);

            for status in later {
                trial.transition(status, Some("retry".into()));
                prop_assert_eq!(trial.status(), terminal);
            }
        }
    }
}
