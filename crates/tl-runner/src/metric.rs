//! Turns wrapper data into observation rows.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use tl_types::{DataError, MetricConfig, MetricMode, Observation, TlResult, Trial};

use crate::cache::FetchCache;
use crate::scoring::ScoringRegistry;
use crate::wrapper::{FetchContext, MetricData, SharedWrapper, TrialData};

/// Fetches and scores one configured metric.
pub struct MetricEvaluator {
    metric: MetricConfig,
    all_metric_names: Vec<String>,
    wrapper: SharedWrapper,
    scoring: Arc<ScoringRegistry>,
    cache: Arc<FetchCache>,
}

impl MetricEvaluator {
    /// Fails with `UnknownScoringFunction` when a scored metric names a
    /// function the registry lacks.
    pub fn new(
        metric: MetricConfig,
        all_metric_names: Vec<String>,
        wrapper: SharedWrapper,
        scoring: Arc<ScoringRegistry>,
        cache: Arc<FetchCache>,
    ) -> TlResult<Self> {
        metric.validate()?;
        scoring.resolve(&metric)?;
        Ok(Self {
            metric,
            all_metric_names,
            wrapper,
            scoring,
            cache,
        })
    }

    pub fn metric(&self) -> &MetricConfig {
        &self.metric
    }

    pub fn name(&self) -> &str {
        &self.metric.name
    }

    pub fn attach_wrapper(&mut self, wrapper: SharedWrapper) {
        self.wrapper = wrapper;
    }

    fn context(&self) -> FetchContext {
        FetchContext {
            metric_name: self.metric.name.clone(),
            metric_properties: self.metric.properties.clone(),
            all_metric_names: self.all_metric_names.clone(),
        }
    }

    /// Fetched data for this metric, calling the wrapper only on a cache
    /// miss. A per-metric response fills the cache for every configured
    /// metric it carries.
    pub fn fetch_data(&self, trial: &Trial) -> TlResult<MetricData> {
        if let Some(data) = self.cache.get(trial.index, &self.metric.name) {
            debug!(trial = trial.index, metric = %self.metric.name, "metric data served from cache");
            return Ok(data);
        }

        match self.wrapper.fetch_trial_data(trial, &self.context())? {
            TrialData::Single(data) => {
                self.cache.store(trial.index, &self.metric.name, data.clone());
                Ok(data)
            }
            TrialData::PerMetric(per_metric) => {
                for (name, data) in per_metric {
                    if self.all_metric_names.contains(&name) {
                        self.cache.store(trial.index, &name, data);
                    } else {
                        warn!(trial = trial.index, key = %name, "ignoring data for unconfigured metric");
                    }
                }
                self.cache.get(trial.index, &self.metric.name).ok_or_else(|| {
                    DataError::MissingMetricData {
                        trial_index: trial.index,
                        metric: self.metric.name.clone(),
                    }
                    .into()
                })
            }
        }
    }

    /// Fetch and score into an observation row.
    pub fn evaluate(&self, trial: &Trial) -> TlResult<Observation> {
        let data = self.fetch_data(trial)?;
        let (mean, fetched_sem) = self.score(data)?;
        let sem = fetched_sem.or(self.metric.noise_sd).unwrap_or(f64::NAN);
        Ok(Observation::new(trial.index, &self.metric.name, mean, sem))
    }

    fn score(&self, data: MetricData) -> TlResult<(f64, Option<f64>)> {
        match (self.metric.mode, data) {
            (MetricMode::Passthrough, MetricData::Value { mean, sem }) => Ok((mean, sem)),
            (MetricMode::Passthrough, MetricData::Kwargs(kwargs)) => {
                let mean = match kwargs.get("mean") {
                    Some(value) => self.number(value)?,
                    None => {
                        return Err(self.shape_error("passthrough data is an object without a `mean`"));
                    }
                };
                Ok((mean, self.sem_of(&kwargs)?))
            }
            (_, MetricData::Kwargs(kwargs)) => {
                let sem = self.sem_of(&kwargs)?;
                let value = match self.scoring.resolve(&self.metric)? {
                    Some(function) => function.call(&kwargs)?,
                    None => return Err(self.shape_error("no scoring function")),
                };
                Ok((value, sem))
            }
            (mode, MetricData::Value { .. }) => {
                Err(self.shape_error(&format!("{mode} metrics expect keyword arguments, got a value")))
            }
        }
    }

    fn sem_of(&self, kwargs: &Map<String, Value>) -> TlResult<Option<f64>> {
        match kwargs.get("sem") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => self.number(value).map(Some),
        }
    }

    fn number(&self, value: &Value) -> TlResult<f64> {
        match value {
            Value::Null => Ok(f64::NAN),
            Value::Array(items) if items.len() == 1 => self.number(&items[0]),
            Value::Number(n) => n.as_f64().ok_or_else(|| self.shape_error("number out of range")),
            other => Err(self.shape_error(&format!("expected a number, got {other}"))),
        }
    }

    fn shape_error(&self, message: &str) -> tl_types::TlError {
        DataError::InvalidShape {
            metric: self.metric.name.clone(),
            message: message.to_string(),
        }
        .into()
    }
}
