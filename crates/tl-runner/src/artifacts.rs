//! On-disk layout of a trial directory and the documents exchanged with
//! external models.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tl_types::{ConfigError, MetricConfig, TlResult, Trial, TrialIndex, TrialStatus};

pub const PARAMETERS_FILE: &str = "parameters.json";
pub const TRIAL_FILE: &str = "trial.json";
pub const DATA_FILE: &str = "data.json";
pub const STATUS_FILE: &str = "trial_status.json";
pub const STATUS_KEY: &str = "trial_status";

pub const OUTPUT_BASES: [&str; 6] = ["output", "outputs", "result", "results", "metric", "metrics"];
pub const OUTPUT_SUFFIXES: [&str; 3] = [".json", ".yml", ".yaml"];

/// Write through a temp file in the same directory, then rename.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> TlResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{name}.tmp.{pid}.{ts}"));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> TlResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Read a JSON or YAML document, chosen by extension.
pub fn read_document(path: &Path) -> TlResult<Value> {
    let text = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => Ok(serde_yaml::from_str(&text)?),
        _ => Ok(serde_json::from_str(&text)?),
    }
}

/// The directory of one trial: `<experiment_dir>/<index:06>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialArtifacts {
    dir: PathBuf,
}

impl TrialArtifacts {
    pub fn new(experiment_dir: &Path, index: TrialIndex) -> Self {
        Self {
            dir: experiment_dir.join(format!("{index:06}")),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// `parameters.json`, `trial.json` and their merge plus metric metadata
    /// in `data.json`.
    pub fn write(&self, trial: &Trial, metrics: &[MetricConfig]) -> TlResult<()> {
        fs::create_dir_all(&self.dir)?;

        let arm = trial.single_arm()?;
        let parameters = serde_json::to_value(&arm.parameters)?;
        let trial_doc = json!({
            "index": trial.index,
            "arm_name": arm.name,
            "generation_step": trial.generation_step,
            "status": trial.status(),
            "created_at": trial.created_at,
        });
        let data = json!({
            "parameters": parameters,
            "trial": trial_doc,
            "metrics": metrics,
        });

        atomic_write_json(&self.path(PARAMETERS_FILE), &parameters)?;
        atomic_write_json(&self.path(TRIAL_FILE), &trial_doc)?;
        atomic_write_json(&self.path(DATA_FILE), &data)?;
        Ok(())
    }

    /// The output file, if any. Two files for one base name are ambiguous.
    pub fn find_output(&self) -> TlResult<Option<PathBuf>> {
        for base in OUTPUT_BASES {
            let found: Vec<PathBuf> = OUTPUT_SUFFIXES
                .iter()
                .map(|suffix| self.dir.join(format!("{base}{suffix}")))
                .filter(|p| p.is_file())
                .collect();

            match found.len() {
                0 => continue,
                1 => return Ok(found.into_iter().next()),
                _ => {
                    return Err(ConfigError::MultipleOutputFiles {
                        base: base.to_string(),
                        files: found.iter().map(|p| p.display().to_string()).collect(),
                    }
                    .into())
                }
            }
        }
        Ok(None)
    }

    /// Status from the dedicated status file, if it exists and carries the
    /// key.
    pub fn read_status_file(&self) -> TlResult<Option<TrialStatus>> {
        let path = self.path(STATUS_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        status_in(&read_document(&path)?)
    }
}

/// The `trial_status` entry of a document, if present.
pub fn status_in(document: &Value) -> TlResult<Option<TrialStatus>> {
    match document.get(STATUS_KEY) {
        Some(token) => TrialStatus::parse_token(token).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tl_types::{Parameters, ParameterValue, TlError};

    fn sample_trial() -> Trial {
        let mut params = Parameters::new();
        params.insert("x0".into(), ParameterValue::Float(1.5));
        params.insert("layers".into(), ParameterValue::Int(3));
        Trial::new(12, params, "random")
    }

    #[test]
    fn writes_trial_documents() {
        let tmp = TempDir::new().unwrap();
        let artifacts = TrialArtifacts::new(tmp.path(), 12);
        assert!(artifacts.dir().ends_with("000012"));

        artifacts.write(&sample_trial(), &[MetricConfig::passthrough("loss")]).unwrap();

        let params = read_document(&artifacts.path(PARAMETERS_FILE)).unwrap();
        assert_eq!(params, json!({"layers": 3, "x0": 1.5}));
        let data = read_document(&artifacts.path(DATA_FILE)).unwrap();
        assert_eq!(data["trial"]["arm_name"], json!("12_0"));
        assert_eq!(data["metrics"][0]["name"], json!("loss"));
    }

    #[test]
    fn output_discovery() {
        let tmp = TempDir::new().unwrap();
        let artifacts = TrialArtifacts::new(tmp.path(), 0);
        fs::create_dir_all(artifacts.dir()).unwrap();
        assert_eq!(artifacts.find_output().unwrap(), None);

        fs::write(artifacts.path("results.yaml"), "loss: 1.0\n").unwrap();
        let found = artifacts.find_output().unwrap().unwrap();
        assert_eq!(read_document(&found).unwrap(), json!({"loss": 1.0}));

        fs::write(artifacts.path("results.json"), "{}").unwrap();
        assert!(matches!(
            artifacts.find_output(),
            Err(TlError::Config(ConfigError::MultipleOutputFiles { ref base, .. })) if base == "results"
        ));
    }

    #[test]
    fn status_file_tokens() {
        let tmp = TempDir::new().unwrap();
        let artifacts = TrialArtifacts::new(tmp.path(), 0);
        fs::create_dir_all(artifacts.dir()).unwrap();
        assert_eq!(artifacts.read_status_file().unwrap(), None);

        fs::write(artifacts.path(STATUS_FILE), r#"{"trial_status": ["early-stopped"]}"#).unwrap();
        assert_eq!(artifacts.read_status_file().unwrap(), Some(TrialStatus::EarlyStopped));

        fs::write(artifacts.path(STATUS_FILE), r#"{"trial_status": 2}"#).unwrap();
        assert_eq!(artifacts.read_status_file().unwrap(), Some(TrialStatus::Failed));

        fs::write(artifacts.path(STATUS_FILE), r#"{"trial_status": "BOGUS"}"#).unwrap();
        assert!(artifacts.read_status_file().is_err());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("doc.json");
        atomic_write_json(&path, &json!({"a": 1})).unwrap();
        atomic_write_json(&path, &json!({"a": 2})).unwrap();

        assert_eq!(read_document(&path).unwrap(), json!({"a": 2}));
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
