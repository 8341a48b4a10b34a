//! Metric configuration, observations and the observation table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{ConfigError, TlResult};
use crate::trial::TrialIndex;

/// Whether we are maximizing or minimizing a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Multiplier that turns a raw value into a "higher is better" value.
    pub fn sign(self) -> f64 {
        match self {
            Self::Maximize => 1.0,
            Self::Minimize => -1.0,
        }
    }
}

/// How a metric turns fetched data into a score.
///
/// The mode is always declared; it is never inferred from the shape of the
/// data a wrapper returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    /// A function from the fixed built-in registry.
    Builtin,
    /// A statistical library function looked up by name.
    Library,
    /// The fetched value is already the score.
    #[default]
    Passthrough,
}

impl std::fmt::Display for MetricMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MetricMode::Builtin => "builtin",
            MetricMode::Library => "library",
            MetricMode::Passthrough => "passthrough",
        })
    }
}

/// One metric of the objective, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub mode: MetricMode,
    /// Scoring function name for `builtin` and `library` modes.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default = "default_minimize")]
    pub minimize: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Standard error used when the fetched data carries none.
    /// `None` leaves the noise unknown (NaN); `Some(0.0)` means noiseless.
    #[serde(default)]
    pub noise_sd: Option<f64>,
    /// Tracked but excluded from the objective.
    #[serde(default)]
    pub info_only: bool,
    /// Free-form properties handed to the wrapper on fetch.
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

fn default_minimize() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

impl MetricConfig {
    pub fn passthrough(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: MetricMode::Passthrough,
            function: None,
            minimize: true,
            weight: 1.0,
            noise_sd: None,
            info_only: false,
            properties: serde_json::Map::new(),
        }
    }

    pub fn builtin(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            mode: MetricMode::Builtin,
            function: Some(function.into()),
            ..Self::passthrough(name)
        }
    }

    pub fn library(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            mode: MetricMode::Library,
            function: Some(function.into()),
            ..Self::passthrough(name)
        }
    }

    pub fn with_minimize(mut self, minimize: bool) -> Self {
        self.minimize = minimize;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_noise_sd(mut self, noise_sd: f64) -> Self {
        self.noise_sd = Some(noise_sd);
        self
    }

    pub fn info_only(mut self) -> Self {
        self.info_only = true;
        self
    }

    pub fn direction(&self) -> ObjectiveDirection {
        if self.minimize {
            ObjectiveDirection::Minimize
        } else {
            ObjectiveDirection::Maximize
        }
    }

    pub fn validate(&self) -> TlResult<()> {
        let invalid = |message: &str| -> crate::errors::TlError {
            ConfigError::InvalidMetric {
                name: self.name.clone(),
                message: message.to_string(),
            }
            .into()
        };

        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "metric name".to_string(),
            }
            .into());
        }
        match (self.mode, &self.function) {
            (MetricMode::Builtin | MetricMode::Library, None) => {
                return Err(invalid("builtin and library metrics need a `function`"));
            }
            (MetricMode::Passthrough, Some(_)) => {
                return Err(invalid("passthrough metrics take no `function`"));
            }
            _ => {}
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(invalid("weight must be a positive number"));
        }
        if let Some(sd) = self.noise_sd {
            if !(sd.is_finite() && sd >= 0.0) {
                return Err(invalid("noise_sd must be a non-negative number"));
            }
        }
        Ok(())
    }
}

/// The `objective` section of the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    pub metrics: Vec<MetricConfig>,
}

impl ObjectiveConfig {
    pub fn new(metrics: Vec<MetricConfig>) -> Self {
        Self { metrics }
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.metrics.is_empty() {
            return Err(ConfigError::MissingField {
                field: "objective.metrics".to_string(),
            }
            .into());
        }

        let mut seen = BTreeSet::new();
        for metric in &self.metrics {
            metric.validate()?;
            if !seen.insert(metric.name.as_str()) {
                return Err(ConfigError::InvalidMetric {
                    name: metric.name.clone(),
                    message: "duplicate metric name".to_string(),
                }
                .into());
            }
        }

        if self.metrics.iter().all(|m| m.info_only) {
            return Err(ConfigError::Invalid {
                message: "objective needs at least one metric that is not info_only".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Serde helpers that encode NaN as `null` and the infinities as the
/// strings `"inf"` / `"-inf"`, which plain JSON numbers cannot carry.
pub mod nan_as_null {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else if *value == f64::INFINITY {
            serializer.serialize_str("inf")
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Encoded>::deserialize(deserializer)? {
            None => Ok(f64::NAN),
            Some(Encoded::Number(value)) => Ok(value),
            Some(Encoded::Text(text)) => match text.to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                _ => Err(D::Error::custom(format!("expected a number, null or inf, got `{text}`"))),
            },
        }
    }
}

/// One row of the observation table.
///
/// A NaN `mean` is a placeholder for a value that has not arrived yet; a NaN
/// `sem` means the noise level is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trial_index: TrialIndex,
    pub metric_name: String,
    #[serde(with = "nan_as_null")]
    pub mean: f64,
    #[serde(with = "nan_as_null")]
    pub sem: f64,
}

impl Observation {
    pub fn new(trial_index: TrialIndex, metric_name: impl Into<String>, mean: f64, sem: f64) -> Self {
        Self {
            trial_index,
            metric_name: metric_name.into(),
            mean,
            sem,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.mean.is_nan()
    }
}

/// Trial × metric table with at most one row per cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Observation>", into = "Vec<Observation>")]
pub struct ObservationTable {
    rows: BTreeMap<(TrialIndex, String), Observation>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, superseding any previous row for the same cell.
    pub fn insert(&mut self, observation: Observation) -> Option<Observation> {
        let key = (observation.trial_index, observation.metric_name.clone());
        self.rows.insert(key, observation)
    }

    pub fn get(&self, trial_index: TrialIndex, metric_name: &str) -> Option<&Observation> {
        self.rows.get(&(trial_index, metric_name.to_string()))
    }

    pub fn rows(&self) -> impl Iterator<Item = &Observation> {
        self.rows.values()
    }

    pub fn for_trial(&self, trial_index: TrialIndex) -> impl Iterator<Item = &Observation> {
        self.rows
            .range((trial_index, String::new())..)
            .take_while(move |((idx, _), _)| *idx == trial_index)
            .map(|(_, obs)| obs)
    }

    /// Cells whose mean is still a NaN placeholder.
    pub fn pending_cells(&self) -> Vec<(TrialIndex, String)> {
        self.rows
            .values()
            .filter(|obs| obs.is_pending())
            .map(|obs| (obs.trial_index, obs.metric_name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<Observation>> for ObservationTable {
    fn from(rows: Vec<Observation>) -> Self {
        let mut table = ObservationTable::new();
        for row in rows {
            table.insert(row);
        }
        table
    }
}

impl From<ObservationTable> for Vec<Observation> {
    fn from(table: ObservationTable) -> Self {
        table.rows.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_defaults_from_yaml() {
        let metric: MetricConfig = serde_yaml::from_str("name: loss").unwrap();
        assert_eq!(metric.mode, MetricMode::Passthrough);
        assert!(metric.minimize);
        assert_eq!(metric.weight, 1.0);
        assert!(metric.noise_sd.is_none());
        assert_eq!(metric.direction(), ObjectiveDirection::Minimize);
        metric.validate().unwrap();
    }

    #[test]
    fn metric_validation() {
        let mut missing_fn = MetricConfig::passthrough("rmse");
        missing_fn.mode = MetricMode::Library;
        assert!(missing_fn.validate().is_err());

        assert!(MetricConfig::passthrough("x").with_weight(0.0).validate().is_err());
        assert!(MetricConfig::passthrough("x").with_noise_sd(-1.0).validate().is_err());
        MetricConfig::builtin("avg", "mean").with_noise_sd(0.0).validate().unwrap();
    }

    #[test]
    fn objective_validation() {
        assert!(ObjectiveConfig::new(vec![]).validate().is_err());

        let dup = ObjectiveConfig::new(vec![MetricConfig::passthrough("a"), MetricConfig::passthrough("a")]);
        assert!(dup.validate().is_err());

        let info = ObjectiveConfig::new(vec![MetricConfig::passthrough("a").info_only()]);
        assert!(info.validate().is_err());

        let ok = ObjectiveConfig::new(vec![
            MetricConfig::passthrough("a"),
            MetricConfig::passthrough("b").info_only(),
        ]);
        ok.validate().unwrap();
    }

    #[test]
    fn observation_nan_round_trips_through_json() {
        let obs = Observation::new(3, "loss", f64::NAN, 0.0);
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains("\"mean\":null"));
        assert!(json.contains("\"sem\":0.0"));

        let back: Observation = serde_json::from_str(&json).unwrap();
        assert!(back.mean.is_nan());
        assert_eq!(back.sem, 0.0);
    }

    #[test]
    fn infinite_observations_stay_infinite() {
        let obs = Observation::new(4, "loss", f64::INFINITY, f64::NEG_INFINITY);
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains("\"mean\":\"inf\""));
        assert!(json.contains("\"sem\":\"-inf\""));

        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obs);
        assert!(!back.is_pending());

        let back: Observation = serde_yaml::from_str(&serde_yaml::to_string(&obs).unwrap()).unwrap();
        assert_eq!(back, obs);

        assert!(serde_json::from_str::<Observation>(r#"{"trial_index":0,"metric_name":"m","mean":"big","sem":0}"#).is_err());
    }

    #[test]
    fn observation_table_keeps_one_row_per_cell() {
        let mut table = ObservationTable::new();
        assert!(table.insert(Observation::new(0, "a", f64::NAN, f64::NAN)).is_none());
        table.insert(Observation::new(0, "b", 2.0, 0.1));
        table.insert(Observation::new(1, "a", 3.0, 0.1));

        let replaced = table.insert(Observation::new(0, "a", 1.0, f64::NAN)).unwrap();
        assert!(replaced.is_pending());
        assert_eq!(table.len(), 3);
        assert_eq!(table.for_trial(1).count(), 1);
        assert_eq!(table.get(0, "a").unwrap().mean, 1.0);
        assert_eq!(table.for_trial(0).count(), 2);
        assert!(table.pending_cells().is_empty());
    }

    #[test]
    fn observation_table_serializes_as_rows() {
        let mut table = ObservationTable::new();
        table.insert(Observation::new(0, "a", 1.0, f64::NAN));
        table.insert(Observation::new(1, "a", f64::NAN, f64::NAN));

        let json = serde_json::to_value(&table).unwrap();
        assert!(json.is_array());
        let back: ObservationTable = serde_json::from_value(json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.pending_cells(), vec![(1, "a".to_string())]);
    }
}
