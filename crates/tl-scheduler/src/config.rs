//! The experiment configuration document.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use tl_optimizer::{GenerationStrategy, GenerationStrategyConfig};
use tl_runner::{read_document, ScriptOptions, ScriptWrapper, SharedWrapper};
use tl_types::{ConfigError, Experiment, ObjectiveConfig, ParametersConfig, SearchSpace, TlResult};

use crate::options::SchedulerOptions;
use crate::scheduler::Scheduler;
use crate::snapshot;

/// Top-level configuration, loaded from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrellisConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub objective: ObjectiveConfig,
    pub parameters: ParametersConfig,
    #[serde(default)]
    pub generation_strategy: GenerationStrategyConfig,
    #[serde(default)]
    pub scheduler: SchedulerOptions,
    #[serde(default)]
    pub script_options: Option<ScriptOptions>,
}

impl TrellisConfig {
    /// Format chosen by extension (`.yml`/`.yaml`, otherwise JSON).
    pub fn from_path(path: &Path) -> TlResult<Self> {
        let config: Self = serde_json::from_value(read_document(path)?)?;
        config.validate()?;
        info!(path = %path.display(), experiment = %config.name, "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> TlResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "name".to_string(),
            }
            .into());
        }
        self.objective.validate()?;
        self.generation_strategy.validate()?;
        self.scheduler.validate()?;
        if let Some(script) = &self.script_options {
            script.validate()?;
        }
        Ok(())
    }

    pub fn build_experiment(&self) -> TlResult<Experiment> {
        let space = SearchSpace::from_config(&self.parameters)?;
        Ok(Experiment::new(self.name.clone(), space, self.objective.clone())?.with_description(self.description.clone()))
    }

    pub fn build_strategy(&self) -> TlResult<GenerationStrategy> {
        GenerationStrategy::from_config(&self.generation_strategy)
    }

    pub fn build_script_wrapper(&self) -> TlResult<ScriptWrapper> {
        let options = self.script_options.clone().ok_or_else(|| ConfigError::MissingField {
            field: "script_options".to_string(),
        })?;
        ScriptWrapper::new(options, self.objective.metrics.clone())
    }

    /// A fresh scheduler. Refuses a `snapshot_path` that already holds an
    /// experiment, which would otherwise be overwritten by the first save.
    pub fn build_scheduler(&self, wrapper: SharedWrapper) -> TlResult<Scheduler> {
        if let Some(path) = self.scheduler.snapshot_path.as_deref().filter(|p| snapshot::exists(p)) {
            return Err(ConfigError::SnapshotExists {
                path: path.display().to_string(),
            }
            .into());
        }
        Scheduler::new(
            self.build_experiment()?,
            self.build_strategy()?,
            wrapper,
            self.scheduler.clone(),
        )
    }

    /// Scheduler driving the configured script wrapper.
    pub fn build_script_scheduler(&self) -> TlResult<(Scheduler, Arc<ScriptWrapper>)> {
        let wrapper = Arc::new(self.build_script_wrapper()?);
        let scheduler = self.build_scheduler(wrapper.clone())?;
        Ok((scheduler, wrapper))
    }
}
