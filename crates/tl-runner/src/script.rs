//! A wrapper that drives an external model through shell commands and
//! files in a per-trial directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tl_types::{
    config_error, DataError, MetricConfig, StatusChange, TlResult, Trial, TrialIndex, TrialStatus,
};

use crate::artifacts::{read_document, status_in, TrialArtifacts};
use crate::process::{run_to_completion, ChildState, ExecDir, ProcessRegistry};
use crate::wrapper::{FetchContext, TrialData, Wrapper, WrapperDescriptor};

/// How long a model may keep running after reporting a terminal status.
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub const SCRIPT_WRAPPER_NAME: &str = "script";

/// The `script_options` section of the configuration document. Commands are
/// argv lists; the trial directory is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptOptions {
    pub experiment_dir: PathBuf,
    #[serde(default)]
    pub append_timestamp: bool,
    #[serde(default)]
    pub write_configs_command: Option<Vec<String>>,
    pub run_model_command: Vec<String>,
    #[serde(default)]
    pub set_trial_status_command: Option<Vec<String>>,
    #[serde(default)]
    pub fetch_trial_data_command: Option<Vec<String>>,
}

impl ScriptOptions {
    pub fn new(experiment_dir: impl Into<PathBuf>, run_model_command: Vec<String>) -> Self {
        Self {
            experiment_dir: experiment_dir.into(),
            append_timestamp: false,
            write_configs_command: None,
            run_model_command,
            set_trial_status_command: None,
            fetch_trial_data_command: None,
        }
    }

    pub fn with_write_configs_command(mut self, argv: Vec<String>) -> Self {
        self.write_configs_command = Some(argv);
        self
    }

    pub fn with_set_trial_status_command(mut self, argv: Vec<String>) -> Self {
        self.set_trial_status_command = Some(argv);
        self
    }

    pub fn with_fetch_trial_data_command(mut self, argv: Vec<String>) -> Self {
        self.fetch_trial_data_command = Some(argv);
        self
    }

    pub fn with_append_timestamp(mut self, append: bool) -> Self {
        self.append_timestamp = append;
        self
    }

    pub fn validate(&self) -> TlResult<()> {
        let commands = [
            ("run_model_command", Some(&self.run_model_command)),
            ("write_configs_command", self.write_configs_command.as_ref()),
            ("set_trial_status_command", self.set_trial_status_command.as_ref()),
            ("fetch_trial_data_command", self.fetch_trial_data_command.as_ref()),
        ];
        for (name, argv) in commands {
            if let Some(argv) = argv {
                if argv.is_empty() || argv[0].trim().is_empty() {
                    return Err(config_error!("script_options.{name} must name a program"));
                }
            }
        }
        if self.experiment_dir.as_os_str().is_empty() {
            return Err(config_error!("script_options.experiment_dir must not be empty"));
        }
        Ok(())
    }

    /// The experiment directory with the optional timestamp suffix applied.
    pub fn resolved_experiment_dir(&self) -> PathBuf {
        if !self.append_timestamp {
            return self.experiment_dir.clone();
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut name = self.experiment_dir.as_os_str().to_os_string();
        name.push(format!("_{stamp}"));
        PathBuf::from(name)
    }
}

/// Wrapper over external commands.
#[derive(Debug)]
pub struct ScriptWrapper {
    options: ScriptOptions,
    metrics: Vec<MetricConfig>,
    processes: Arc<ProcessRegistry>,
}

impl ScriptWrapper {
    /// Resolves and creates the experiment directory. The stored options
    /// carry the resolved directory, so a wrapper rebuilt from its
    /// descriptor reuses it.
    pub fn new(options: ScriptOptions, metrics: Vec<MetricConfig>) -> TlResult<Self> {
        options.validate()?;
        let experiment_dir = options.resolved_experiment_dir();
        fs::create_dir_all(&experiment_dir)?;
        info!(dir = %experiment_dir.display(), "script wrapper experiment directory ready");

        let options = ScriptOptions {
            experiment_dir,
            append_timestamp: false,
            ..options
        };
        Ok(Self {
            options,
            metrics,
            processes: Arc::new(ProcessRegistry::new()),
        })
    }

    /// Rebuild from the descriptor recorded in a snapshot.
    pub fn from_descriptor(descriptor: &WrapperDescriptor) -> TlResult<Self> {
        let options: ScriptOptions = serde_json::from_value(descriptor.options["script_options"].clone())?;
        let metrics: Vec<MetricConfig> = match descriptor.options.get("metrics") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        Self::new(options, metrics)
    }

    pub fn options(&self) -> &ScriptOptions {
        &self.options
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.options.experiment_dir
    }

    /// Handle used to terminate running models on shutdown.
    pub fn processes(&self) -> Arc<ProcessRegistry> {
        self.processes.clone()
    }

    pub fn artifacts(&self, index: TrialIndex) -> TrialArtifacts {
        TrialArtifacts::new(&self.options.experiment_dir, index)
    }

    fn run_hook(&self, argv: &Option<Vec<String>>, artifacts: &TrialArtifacts) -> TlResult<()> {
        match argv {
            Some(argv) => run_to_completion(argv, artifacts.dir(), &ExecDir::new(artifacts.dir())),
            None => Ok(()),
        }
    }
}

fn apply_status(trial: &mut Trial, status: TrialStatus, source: &str) -> StatusChange {
    let reason = match status {
        TrialStatus::Failed | TrialStatus::Abandoned => Some(format!("reported by {source}")),
        _ => None,
    };
    trial.transition(status, reason)
}

impl Wrapper for ScriptWrapper {
    fn descriptor(&self) -> WrapperDescriptor {
        WrapperDescriptor::new(SCRIPT_WRAPPER_NAME)
            .with_path(self.options.experiment_dir.display().to_string())
            .with_options(json!({
                "script_options": self.options,
                "metrics": self.metrics,
            }))
    }

    fn write_configs(&self, trial: &Trial) -> TlResult<()> {
        let artifacts = self.artifacts(trial.index);
        artifacts.write(trial, &self.metrics)?;
        self.run_hook(&self.options.write_configs_command, &artifacts)
    }

    fn run_model(&self, trial: &Trial) -> TlResult<()> {
        let artifacts = self.artifacts(trial.index);
        self.processes.spawn(
            trial.index,
            &self.options.run_model_command,
            artifacts.dir(),
            &ExecDir::new(artifacts.dir()),
        )?;
        Ok(())
    }

    /// Status command, then status file, then output file (implicitly
    /// completed), then the model process's exit code. The process is polled
    /// before the files are read so an exit is never missed, and a process
    /// still alive once its trial is finished is reaped.
    fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
        let artifacts = self.artifacts(trial.index);
        self.run_hook(&self.options.set_trial_status_command, &artifacts)?;
        let process = self.processes.poll(trial.index)?;

        let reported = if let Some(status) = artifacts.read_status_file()? {
            Some((status, "status file"))
        } else if let Some(output) = artifacts.find_output()? {
            let status = status_in(&read_document(&output)?)?.unwrap_or(TrialStatus::Completed);
            Some((status, "output file"))
        } else {
            None
        };

        if let Some((status, source)) = reported {
            debug!(trial = trial.index, %status, source, "status reported by model");
            let change = apply_status(trial, status, source);
            if trial.is_terminal() && process == ChildState::Running {
                self.processes.finish(trial.index, EXIT_GRACE)?;
            }
            return Ok(change);
        }

        match process {
            ChildState::Running => Ok(trial.mark_running()),
            ChildState::Exited(exit) if !exit.success() => Ok(trial.mark_failed(format!("model process exited with {exit}"))),
            ChildState::Exited(_) if self.options.fetch_trial_data_command.is_some() => Ok(trial.mark_completed()),
            ChildState::Exited(_) => Ok(trial.mark_failed("model process exited without writing an output file")),
            // not launched by this process (e.g. resumed); nothing to learn yet
            ChildState::Untracked => Ok(StatusChange::Unchanged(trial.status())),
        }
    }

    fn fetch_trial_data(&self, trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
        let artifacts = self.artifacts(trial.index);
        self.run_hook(&self.options.fetch_trial_data_command, &artifacts)?;

        let output = artifacts.find_output()?.ok_or_else(|| DataError::NoOutputFile {
            dir: artifacts.dir().display().to_string(),
        })?;
        TrialData::per_metric_from_json(&read_document(&output)?)
    }
}
