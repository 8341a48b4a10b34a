//! The wrapper contract: how the scheduler talks to the thing being
//! optimized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use tl_types::{DataError, StatusChange, TlError, TlResult, Trial, WrapperOperation};

/// Identifies a wrapper inside a snapshot so it can be rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperDescriptor {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub options: Value,
}

impl WrapperDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            options: Value::Null,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// What a fetch is for, passed explicitly alongside the trial.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchContext {
    pub metric_name: String,
    pub metric_properties: Map<String, Value>,
    pub all_metric_names: Vec<String>,
}

/// Data fetched for one metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricData {
    /// A final value. `mean` is NaN for a pending (null) value.
    Value { mean: f64, sem: Option<f64> },
    /// Keyword arguments for a scoring function. A `sem` entry, when
    /// present, is the noise of the scored value.
    Kwargs(Map<String, Value>),
}

impl MetricData {
    pub fn value(mean: f64) -> Self {
        Self::Value { mean, sem: None }
    }

    pub fn with_sem(mean: f64, sem: f64) -> Self {
        Self::Value { mean, sem: Some(sem) }
    }

    /// Interpret one metric entry of a JSON response: numbers and `null`
    /// are values, objects are keyword arguments, single-element lists are
    /// unwrapped.
    pub fn from_json(metric: &str, value: &Value) -> TlResult<Self> {
        match value {
            Value::Null => Ok(Self::value(f64::NAN)),
            Value::Number(n) => n.as_f64().map(Self::value).ok_or_else(|| {
                DataError::InvalidShape {
                    metric: metric.to_string(),
                    message: format!("number {n} is not representable as f64"),
                }
                .into()
            }),
            Value::Array(items) if items.len() == 1 => Self::from_json(metric, &items[0]),
            Value::Object(map) => Ok(Self::Kwargs(map.clone())),
            other => Err(DataError::InvalidShape {
                metric: metric.to_string(),
                message: format!("expected a number, null or an object, got {other}"),
            }
            .into()),
        }
    }
}

/// A wrapper's answer to `fetch_trial_data`.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialData {
    /// Data for the requested metric only.
    Single(MetricData),
    /// Data for several metrics at once, keyed by metric name.
    PerMetric(BTreeMap<String, MetricData>),
}

impl TrialData {
    /// Parse a per-metric JSON object. `trial_status` is status, not data.
    pub fn per_metric_from_json(value: &Value) -> TlResult<Self> {
        let Value::Object(map) = value else {
            return Err(DataError::InvalidShape {
                metric: "*".to_string(),
                message: format!("expected an object keyed by metric name, got {value}"),
            }
            .into());
        };

        let mut metrics = BTreeMap::new();
        for (name, entry) in map.iter().filter(|(k, _)| k.as_str() != "trial_status") {
            metrics.insert(name.clone(), MetricData::from_json(name, entry)?);
        }
        Ok(Self::PerMetric(metrics))
    }
}

/// Adapter around an external model.
///
/// Implementations must not block indefinitely in `run_model`; completion is
/// discovered later through `set_trial_status`.
pub trait Wrapper: Send + Sync {
    fn descriptor(&self) -> WrapperDescriptor;

    fn write_configs(&self, _trial: &Trial) -> TlResult<()> {
        Ok(())
    }

    fn run_model(&self, trial: &Trial) -> TlResult<()>;

    /// Inspect external state and move the trial through its state machine.
    fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange>;

    fn fetch_trial_data(&self, trial: &Trial, context: &FetchContext) -> TlResult<TrialData>;
}

pub type SharedWrapper = Arc<dyn Wrapper>;

/// Logs every failing wrapper call and re-raises it tagged with the trial
/// index and operation.
pub struct Instrumented {
    inner: SharedWrapper,
}

impl Instrumented {
    pub fn wrap(inner: SharedWrapper) -> SharedWrapper {
        Arc::new(Self { inner })
    }

    fn check<T>(&self, trial: &Trial, operation: WrapperOperation, result: TlResult<T>) -> TlResult<T> {
        result.map_err(|err| {
            let err = match err {
                already @ TlError::Wrapper { .. } => already,
                other => TlError::wrapper(trial.index, operation, other),
            };
            error!(
                wrapper = %self.inner.descriptor().name,
                trial = trial.index,
                operation = %operation,
                error = %err.chain(),
                "wrapper call failed"
            );
            err
        })
    }
}

impl Wrapper for Instrumented {
    fn descriptor(&self) -> WrapperDescriptor {
        self.inner.descriptor()
    }

    fn write_configs(&self, trial: &Trial) -> TlResult<()> {
        debug!(trial = trial.index, "write_configs");
        self.check(trial, WrapperOperation::WriteConfigs, self.inner.write_configs(trial))
    }

    fn run_model(&self, trial: &Trial) -> TlResult<()> {
        debug!(trial = trial.index, "run_model");
        self.check(trial, WrapperOperation::RunModel, self.inner.run_model(trial))
    }

    fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
        let result = self.inner.set_trial_status(trial);
        self.check(trial, WrapperOperation::SetTrialStatus, result)
    }

    fn fetch_trial_data(&self, trial: &Trial, context: &FetchContext) -> TlResult<TrialData> {
        debug!(trial = trial.index, metric = %context.metric_name, "fetch_trial_data");
        self.check(
            trial,
            WrapperOperation::FetchTrialData,
            self.inner.fetch_trial_data(trial, context),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tl_types::{Parameters, TrialError};

    struct Broken;

    impl Wrapper for Broken {
        fn descriptor(&self) -> WrapperDescriptor {
            WrapperDescriptor::new("broken")
        }

        fn run_model(&self, trial: &Trial) -> TlResult<()> {
            Err(TrialError::NotFound { index: trial.index }.into())
        }

        fn set_trial_status(&self, _trial: &mut Trial) -> TlResult<StatusChange> {
            Err(TrialError::UnknownStatus { token: "BOGUS".into() }.into())
        }

        fn fetch_trial_data(&self, _trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
            Ok(TrialData::Single(MetricData::value(1.0)))
        }
    }

    #[test]
    fn instrumented_tags_errors() {
        let wrapper = Instrumented::wrap(Arc::new(Broken));
        let mut trial = Trial::new(4, Parameters::new(), "manual");

        let err = wrapper.run_model(&trial).unwrap_err();
        assert_eq!(err.trial_index(), Some(4));
        assert!(err.to_string().contains("run_model"));

        let err = wrapper.set_trial_status(&mut trial).unwrap_err();
        assert!(err.chain().contains("BOGUS"));

        // successful calls pass straight through
        assert!(wrapper.write_configs(&trial).is_ok());
        assert_eq!(wrapper.descriptor().name, "broken");
    }

    #[test]
    fn double_wrapping_keeps_first_context() {
        let wrapper = Instrumented::wrap(Instrumented::wrap(Arc::new(Broken)));
        let trial = Trial::new(1, Parameters::new(), "manual");
        let err = wrapper.run_model(&trial).unwrap_err();
        assert_eq!(err.to_string().matches("run_model").count(), 1);
    }

    #[test]
    fn per_metric_json() {
        let value = json!({
            "loss": 0.5,
            "pending": null,
            "scored": {"a": [1, 2], "sem": 0.1},
            "wrapped": [3.0],
            "trial_status": "COMPLETED",
        });
        let TrialData::PerMetric(metrics) = TrialData::per_metric_from_json(&value).unwrap() else {
            panic!("expected per-metric data");
        };
        assert_eq!(metrics.len(), 4);
        assert_eq!(metrics["loss"], MetricData::value(0.5));
        assert!(matches!(metrics["pending"], MetricData::Value { mean, .. } if mean.is_nan()));
        assert!(matches!(&metrics["scored"], MetricData::Kwargs(kw) if kw.contains_key("a")));
        assert_eq!(metrics["wrapped"], MetricData::value(3.0));

        assert!(TrialData::per_metric_from_json(&json!([1, 2])).is_err());
        assert!(MetricData::from_json("x", &json!("text")).is_err());
    }
}
