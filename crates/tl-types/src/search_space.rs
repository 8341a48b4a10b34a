//! Search space definitions and their configuration-document form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ConfigError, TlResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<ParameterValue> },
    /// A constant carried along with every trial.
    Fixed { value: ParameterValue },
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<ParameterValue>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn add_fixed(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Fixed { value },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Build a search space from its configuration-document form.
    pub fn from_config(config: &ParametersConfig) -> TlResult<Self> {
        let mut space = SearchSpace::new();
        for (name, param) in config.entries() {
            if space.get(&name).is_some() {
                return Err(invalid(&name, "duplicate parameter name"));
            }
            space.parameters.push(ParameterDef {
                kind: param.to_kind(&name)?,
                name,
            });
        }
        space.validate()?;
        Ok(space)
    }

    /// Check bounds and choice lists.
    pub fn validate(&self) -> TlResult<()> {
        if self.parameters.is_empty() {
            return Err(ConfigError::MissingField {
                field: "parameters".to_string(),
            }
            .into());
        }

        for param in &self.parameters {
            match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    if !(low.is_finite() && high.is_finite() && low < high) {
                        return Err(invalid(&param.name, "bounds must be finite with low < high"));
                    }
                }
                ParameterKind::IntRange { low, high } => {
                    if low >= high {
                        return Err(invalid(&param.name, "bounds must satisfy low < high"));
                    }
                }
                ParameterKind::LogUniform { low, high } => {
                    if !(*low > 0.0 && low < high && high.is_finite()) {
                        return Err(invalid(&param.name, "log-scale bounds must satisfy 0 < low < high"));
                    }
                }
                ParameterKind::Choice { values } => {
                    if values.is_empty() {
                        return Err(invalid(&param.name, "choice parameter needs at least one value"));
                    }
                }
                ParameterKind::Fixed { .. } => {}
            }
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(name: &str, message: &str) -> crate::errors::TlError {
    ConfigError::InvalidParameter {
        name: name.to_string(),
        message: message.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Configuration-document form
// ---------------------------------------------------------------------------

/// Numeric type of a range parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
}

/// One parameter descriptor as written in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterConfig {
    Range {
        bounds: Vec<ParameterValue>,
        #[serde(default)]
        value_type: Option<ValueType>,
        #[serde(default)]
        log_scale: bool,
    },
    Choice {
        values: Vec<ParameterValue>,
    },
    Fixed {
        value: ParameterValue,
    },
}

impl ParameterConfig {
    fn to_kind(&self, name: &str) -> TlResult<ParameterKind> {
        match self {
            ParameterConfig::Range {
                bounds,
                value_type,
                log_scale,
            } => {
                let [low, high] = bounds.as_slice() else {
                    return Err(invalid(name, "range bounds must have exactly two entries"));
                };
                let both_int = matches!((low, high), (ParameterValue::Int(_), ParameterValue::Int(_)));
                let value_type = value_type.unwrap_or(if both_int { ValueType::Int } else { ValueType::Float });

                match (value_type, *log_scale) {
                    (ValueType::Int, false) => {
                        let (ParameterValue::Int(low), ParameterValue::Int(high)) = (low, high) else {
                            return Err(invalid(name, "integer range needs integer bounds"));
                        };
                        Ok(ParameterKind::IntRange { low: *low, high: *high })
                    }
                    (ValueType::Int, true) => Err(invalid(name, "log scale is only supported for float ranges")),
                    (ValueType::Float, log) => {
                        let (Some(low), Some(high)) = (low.as_f64(), high.as_f64()) else {
                            return Err(invalid(name, "range bounds must be numeric"));
                        };
                        Ok(if log {
                            ParameterKind::LogUniform { low, high }
                        } else {
                            ParameterKind::FloatRange { low, high }
                        })
                    }
                }
            }
            ParameterConfig::Choice { values } => Ok(ParameterKind::Choice {
                values: values.clone(),
            }),
            ParameterConfig::Fixed { value } => Ok(ParameterKind::Fixed {
                value: value.clone(),
            }),
        }
    }
}

/// A descriptor in list form, carrying its own name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedParameterConfig {
    pub name: String,
    #[serde(flatten)]
    pub config: ParameterConfig,
}

/// The `parameters` section: either a list of named descriptors or a
/// name-keyed mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParametersConfig {
    List(Vec<NamedParameterConfig>),
    Map(BTreeMap<String, ParameterConfig>),
}

impl ParametersConfig {
    fn entries(&self) -> Vec<(String, &ParameterConfig)> {
        match self {
            ParametersConfig::List(items) => items.iter().map(|p| (p.name.clone(), &p.config)).collect(),
            ParametersConfig::Map(items) => items.iter().map(|(k, v)| (k.clone(), v)).collect(),
        }
    }
}
