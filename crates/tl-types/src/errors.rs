use thiserror::Error;

use crate::trial::TrialIndex;

/// Main error type for the Trellis system
#[derive(Error, Debug)]
pub enum TlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Wrapper {operation} failed for trial {trial_index}")]
    Wrapper {
        trial_index: TrialIndex,
        operation: WrapperOperation,
        #[source]
        source: Box<TlError>,
    },

    #[error(
        "Failure rate exceeded: {failed} of {finished} finished trials failed (tolerated rate {tolerated})"
    )]
    FailureRateExceeded {
        failed: usize,
        finished: usize,
        tolerated: f64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TlError {
    /// Wrap an error raised inside a wrapper call with the trial and operation it came from.
    pub fn wrapper(trial_index: TrialIndex, operation: WrapperOperation, source: TlError) -> Self {
        TlError::Wrapper {
            trial_index,
            operation,
            source: Box::new(source),
        }
    }

    /// This error and its sources joined by `": "`, as recorded in a trial's
    /// failure reason. A source already quoted by its parent is not repeated.
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            let text = err.to_string();
            if !message.ends_with(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = err.source();
        }
        message
    }

    /// Trial index of a wrapper failure, if this error is one.
    pub fn trial_index(&self) -> Option<TrialIndex> {
        match self {
            TlError::Wrapper { trial_index, .. } => Some(*trial_index),
            _ => None,
        }
    }
}

/// The wrapper operation an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperOperation {
    WriteConfigs,
    RunModel,
    SetTrialStatus,
    FetchTrialData,
}

impl std::fmt::Display for WrapperOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WriteConfigs => "write_configs",
            Self::RunModel => "run_model",
            Self::SetTrialStatus => "set_trial_status",
            Self::FetchTrialData => "fetch_trial_data",
        };
        f.write_str(name)
    }
}

/// Configuration errors. Always fatal, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Options `{first}` and `{second}` are mutually exclusive")]
    MutuallyExclusive { first: String, second: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error(
        "Wrapper `{name}` is not registered (recorded path: {path}); register it in the serialization context before loading"
    )]
    UnknownWrapper { name: String, path: String },

    #[error("Unknown {kind} scoring function: {name}")]
    UnknownScoringFunction { kind: String, name: String },

    #[error("Invalid parameter `{name}`: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("Invalid metric `{name}`: {message}")]
    InvalidMetric { name: String, message: String },

    #[error("Multiple output files for base name `{base}`: {files:?}")]
    MultipleOutputFiles { base: String, files: Vec<String> },

    #[error("A snapshot already exists at {path}; continue it with `trellis resume --snapshot {path}` or choose a new path")]
    SnapshotExists { path: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Trial lifecycle errors
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial {index} has {arms} arms; only single-arm trials are supported")]
    UnsupportedBatchTrial { index: TrialIndex, arms: usize },

    #[error("Unrecognized trial status token: {token}")]
    UnknownStatus { token: String },

    #[error("Trial not found: {index}")]
    NotFound { index: TrialIndex },

    #[error("Trial {index} is not terminal (status {status})")]
    NotTerminal { index: TrialIndex, status: String },
}

/// Metric data errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("No data for metric `{metric}` on trial {trial_index}")]
    MissingMetricData {
        trial_index: TrialIndex,
        metric: String,
    },

    #[error("Unexpected data shape for metric `{metric}`: {message}")]
    InvalidShape { metric: String, message: String },

    #[error("Scoring function `{function}` is missing argument `{argument}`")]
    MissingArgument { function: String, argument: String },

    #[error("Scoring function `{function}` failed: {message}")]
    Scoring { function: String, message: String },

    #[error("No output file found in {dir}")]
    NoOutputFile { dir: String },

    #[error("Backfill reconciliation failed: {message}")]
    Backfill { message: String },
}

/// Snapshot persistence errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot not found: {path}")]
    NotFound { path: String },

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Snapshot is missing `{key}`")]
    MissingKey { key: String },
}

/// Result type alias for Trellis operations
pub type TlResult<T> = Result<T, TlError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TlError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TlError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TlError::Config($crate::ConfigError::Invalid { message: format!($($arg)*) })
    };
}
