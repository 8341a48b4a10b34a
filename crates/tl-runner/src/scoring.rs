//! Named scoring functions that turn fetched keyword arguments into a
//! metric value.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use tl_types::{ConfigError, DataError, MetricConfig, MetricMode, TlResult};

/// The subset of fetched keyword arguments a function declared.
#[derive(Debug, Clone)]
pub struct ScoringArgs<'a> {
    function: &'a str,
    values: Map<String, Value>,
}

impl<'a> ScoringArgs<'a> {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> TlResult<f64> {
        let value = self.require(name)?;
        match value {
            Value::Array(items) if items.len() == 1 => to_f64(self.function, name, &items[0]),
            other => to_f64(self.function, name, other),
        }
    }

    pub fn vector(&self, name: &str) -> TlResult<Vec<f64>> {
        match self.require(name)? {
            Value::Array(items) => items.iter().map(|v| to_f64(self.function, name, v)).collect(),
            scalar => Ok(vec![to_f64(self.function, name, scalar)?]),
        }
    }

    fn require(&self, name: &str) -> TlResult<&Value> {
        self.values.get(name).ok_or_else(|| {
            DataError::MissingArgument {
                function: self.function.to_string(),
                argument: name.to_string(),
            }
            .into()
        })
    }
}

fn to_f64(function: &str, argument: &str, value: &Value) -> TlResult<f64> {
    match value {
        Value::Null => Ok(f64::NAN),
        Value::Number(n) => n.as_f64().ok_or_else(|| scoring_error(function, format!("`{argument}` is out of range"))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(scoring_error(function, format!("`{argument}` must be numeric, got {other}"))),
    }
}

fn scoring_error(function: &str, message: String) -> tl_types::TlError {
    DataError::Scoring {
        function: function.to_string(),
        message,
    }
    .into()
}

pub type ScoreFn = Arc<dyn Fn(&ScoringArgs<'_>) -> TlResult<f64> + Send + Sync>;

/// A registered function and the arguments it accepts.
#[derive(Clone)]
pub struct ScoringFunction {
    pub name: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    score: ScoreFn,
}

impl std::fmt::Debug for ScoringFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringFunction")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .finish()
    }
}

impl ScoringFunction {
    /// Call with only the declared arguments; anything else in `kwargs` is
    /// never seen by the function.
    pub fn call(&self, kwargs: &Map<String, Value>) -> TlResult<f64> {
        let mut values = Map::new();
        for name in self.required.iter().chain(&self.optional) {
            if let Some(v) = kwargs.get(name) {
                values.insert(name.clone(), v.clone());
            }
        }
        let args = ScoringArgs {
            function: &self.name,
            values,
        };
        for name in &self.required {
            args.require(name)?;
        }
        (self.score)(&args)
    }
}

/// Scoring functions per metric mode.
#[derive(Debug, Clone, Default)]
pub struct ScoringRegistry {
    functions: BTreeMap<(MetricMode, String), ScoringFunction>,
}

impl ScoringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the builtin and library functions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // ---- builtin ----
        registry.register(MetricMode::Builtin, "mean", &["a"], &[], |args| {
            let a = non_empty(args, "mean", "a")?;
            Ok(a.iter().sum::<f64>() / a.len() as f64)
        });
        registry.register(MetricMode::Builtin, "median", &["a"], &[], |args| {
            let mut a = non_empty(args, "median", "a")?;
            a.sort_by(f64::total_cmp);
            let mid = a.len() / 2;
            Ok(if a.len() % 2 == 0 { (a[mid - 1] + a[mid]) / 2.0 } else { a[mid] })
        });
        registry.register(MetricMode::Builtin, "sum", &["a"], &[], |args| Ok(args.vector("a")?.iter().sum()));
        registry.register(MetricMode::Builtin, "min", &["a"], &[], |args| {
            Ok(non_empty(args, "min", "a")?.into_iter().fold(f64::INFINITY, f64::min))
        });
        registry.register(MetricMode::Builtin, "max", &["a"], &[], |args| {
            Ok(non_empty(args, "max", "a")?.into_iter().fold(f64::NEG_INFINITY, f64::max))
        });
        registry.register(MetricMode::Builtin, "std", &["a"], &["ddof"], |args| {
            let a = non_empty(args, "std", "a")?;
            let ddof = match args.get("ddof") {
                Some(_) => args.scalar("ddof")?,
                None => 0.0,
            };
            let n = a.len() as f64;
            if n - ddof <= 0.0 {
                return Err(scoring_error("std", format!("ddof {ddof} leaves no degrees of freedom")));
            }
            let mean = a.iter().sum::<f64>() / n;
            let var = a.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - ddof);
            Ok(var.sqrt())
        });
        registry.register(MetricMode::Builtin, "branin", &["x1", "x2"], &[], |args| {
            Ok(branin(args.scalar("x1")?, args.scalar("x2")?))
        });
        registry.register(MetricMode::Builtin, "sphere", &["x"], &[], |args| {
            Ok(args.vector("x")?.iter().map(|v| v * v).sum())
        });

        // ---- library ----
        registry.register(MetricMode::Library, "mean_squared_error", &["y_true", "y_pred"], &[], |args| {
            mse(&paired(args, "mean_squared_error")?)
        });
        registry.register(
            MetricMode::Library,
            "root_mean_squared_error",
            &["y_true", "y_pred"],
            &[],
            |args| Ok(mse(&paired(args, "root_mean_squared_error")?)?.sqrt()),
        );
        registry.register(
            MetricMode::Library,
            "normalized_root_mean_squared_error",
            &["y_true", "y_pred"],
            &[],
            |args| {
                let pairs = paired(args, "normalized_root_mean_squared_error")?;
                let (lo, hi) = pairs
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (t, _)| (lo.min(*t), hi.max(*t)));
                let range = hi - lo;
                if range == 0.0 {
                    return Err(scoring_error(
                        "normalized_root_mean_squared_error",
                        "y_true has zero range".to_string(),
                    ));
                }
                Ok(mse(&pairs)?.sqrt() / range)
            },
        );
        registry.register(MetricMode::Library, "mean_absolute_error", &["y_true", "y_pred"], &[], |args| {
            let pairs = paired(args, "mean_absolute_error")?;
            Ok(pairs.iter().map(|(t, p)| (t - p).abs()).sum::<f64>() / pairs.len() as f64)
        });
        registry.register(MetricMode::Library, "r2_score", &["y_true", "y_pred"], &[], |args| {
            let pairs = paired(args, "r2_score")?;
            let n = pairs.len() as f64;
            let mean = pairs.iter().map(|(t, _)| t).sum::<f64>() / n;
            let ss_res: f64 = pairs.iter().map(|(t, p)| (t - p).powi(2)).sum();
            let ss_tot: f64 = pairs.iter().map(|(t, _)| (t - mean).powi(2)).sum();
            if ss_tot == 0.0 {
                return Err(scoring_error("r2_score", "y_true is constant".to_string()));
            }
            Ok(1.0 - ss_res / ss_tot)
        });

        registry
    }

    pub fn register<F>(&mut self, mode: MetricMode, name: &str, required: &[&str], optional: &[&str], score: F)
    where
        F: Fn(&ScoringArgs<'_>) -> TlResult<f64> + Send + Sync + 'static,
    {
        let function = ScoringFunction {
            name: name.to_string(),
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
            score: Arc::new(score),
        };
        self.functions.insert((mode, name.to_string()), function);
    }

    pub fn get(&self, mode: MetricMode, name: &str) -> TlResult<&ScoringFunction> {
        self.functions.get(&(mode, name.to_string())).ok_or_else(|| {
            ConfigError::UnknownScoringFunction {
                kind: mode.to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn names(&self, mode: MetricMode) -> Vec<&str> {
        self.functions
            .keys()
            .filter(|(m, _)| *m == mode)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// The function a scored metric uses; `None` for passthrough metrics.
    pub fn resolve(&self, metric: &MetricConfig) -> TlResult<Option<&ScoringFunction>> {
        match metric.mode {
            MetricMode::Passthrough => Ok(None),
            mode => {
                let name = metric.function.as_deref().ok_or_else(|| ConfigError::InvalidMetric {
                    name: metric.name.clone(),
                    message: format!("{mode} metrics need a `function`"),
                })?;
                self.get(mode, name).map(Some)
            }
        }
    }
}

fn non_empty(args: &ScoringArgs<'_>, function: &str, name: &str) -> TlResult<Vec<f64>> {
    let values = args.vector(name)?;
    if values.is_empty() {
        return Err(scoring_error(function, format!("`{name}` is empty")));
    }
    Ok(values)
}

fn paired(args: &ScoringArgs<'_>, function: &str) -> TlResult<Vec<(f64, f64)>> {
    let y_true = non_empty(args, function, "y_true")?;
    let y_pred = args.vector("y_pred")?;
    if y_true.len() != y_pred.len() {
        return Err(scoring_error(
            function,
            format!("y_true has {} values but y_pred has {}", y_true.len(), y_pred.len()),
        ));
    }
    Ok(y_true.into_iter().zip(y_pred).collect())
}

fn mse(pairs: &[(f64, f64)]) -> TlResult<f64> {
    Ok(pairs.iter().map(|(t, p)| (t - p).powi(2)).sum::<f64>() / pairs.len() as f64)
}

/// Branin-Hoo test function; global minimum ≈ 0.397887.
pub fn branin(x1: f64, x2: f64) -> f64 {
    use std::f64::consts::PI;
    let a = 1.0;
    let b = 5.1 / (4.0 * PI * PI);
    let c = 5.0 / PI;
    let r = 6.0;
    let s = 10.0;
    let t = 1.0 / (8.0 * PI);
    a * (x2 - b * x1 * x1 + c * x1 - r).powi(2) + s * (1.0 - t) * x1.cos() + s
}
