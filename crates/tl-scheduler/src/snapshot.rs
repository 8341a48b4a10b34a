//! Scheduler snapshots: save, load and wrapper reattachment.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tl_optimizer::GenerationStrategy;
use tl_runner::{
    atomic_write_bytes, read_document, ScoringRegistry, ScriptWrapper, SharedWrapper, WrapperDescriptor,
    SCRIPT_WRAPPER_NAME,
};
use tl_types::{ConfigError, Experiment, SnapshotError, TlResult};

use crate::options::SchedulerOptions;
use crate::scheduler::Scheduler;

pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_KEYS: [&str; 5] = ["version", "experiment", "generation_strategy", "options", "wrapper"];

/// Everything needed to rebuild a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub version: u32,
    pub experiment: Experiment,
    pub generation_strategy: GenerationStrategy,
    pub options: SchedulerOptions,
    pub wrapper: WrapperDescriptor,
}

impl SnapshotDocument {
    pub fn capture(scheduler: &Scheduler) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            experiment: scheduler.experiment().clone(),
            generation_strategy: scheduler.generation_strategy().clone(),
            options: scheduler.options().clone(),
            wrapper: scheduler.runner().wrapper().descriptor(),
        }
    }

    /// Checks the top-level layout before decoding.
    pub fn from_value(value: Value) -> TlResult<Self> {
        for key in SNAPSHOT_KEYS {
            if value.get(key).is_none() {
                return Err(SnapshotError::MissingKey { key: key.to_string() }.into());
            }
        }
        let found = value["version"].as_u64().unwrap_or(0) as u32;
        if found != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found,
                expected: SNAPSHOT_VERSION,
            }
            .into());
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Side file written when the JSON encoding fails.
pub fn degraded_path(path: &Path) -> PathBuf {
    path.with_extension("yaml")
}

/// Whether a snapshot (or its YAML side file) is already stored at `path`.
pub fn exists(path: &Path) -> bool {
    path.exists() || degraded_path(path).exists()
}

/// Write the scheduler's snapshot atomically; returns the file written.
pub fn save(scheduler: &Scheduler, path: &Path) -> TlResult<PathBuf> {
    let document = SnapshotDocument::capture(scheduler);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    match serde_json::to_vec_pretty(&document) {
        Ok(bytes) => {
            atomic_write_bytes(path, &bytes)?;
            let side = degraded_path(path);
            if side != path {
                remove_stale(&side)?;
            }
            Ok(path.to_path_buf())
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "snapshot is not JSON-encodable; writing YAML side file"
            );
            write_degraded(&document, path)
        }
    }
}

/// Write the YAML side file for `path` and drop the older JSON snapshot, so
/// `read` only ever finds the newest state.
pub(crate) fn write_degraded(document: &SnapshotDocument, path: &Path) -> TlResult<PathBuf> {
    let side = degraded_path(path);
    save_yaml(document, &side)?;
    if side != path {
        remove_stale(path)?;
    }
    info!(side_file = %side.display(), "snapshot written as YAML");
    Ok(side)
}

fn remove_stale(path: &Path) -> TlResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed superseded snapshot file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn save_yaml(document: &SnapshotDocument, path: &Path) -> TlResult<()> {
    let text = serde_yaml::to_string(document)?;
    atomic_write_bytes(path, text.as_bytes())
}

/// Read a snapshot document, falling back to the YAML side file when the
/// JSON file is absent.
pub fn read(path: &Path) -> TlResult<SnapshotDocument> {
    let source = if path.exists() {
        path.to_path_buf()
    } else {
        let side = degraded_path(path);
        if !side.exists() {
            return Err(SnapshotError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        warn!(path = %side.display(), "loading snapshot from YAML side file");
        side
    };
    SnapshotDocument::from_value(read_document(&source)?)
}

/// Rebuild a scheduler from a snapshot, resolving its wrapper through
/// `context`.
pub fn load(path: &Path, context: &SerializationContext) -> TlResult<Scheduler> {
    let document = read(path)?;
    let wrapper = context.build_wrapper(&document.wrapper)?;
    let scheduler = Scheduler::with_scoring(
        document.experiment,
        document.generation_strategy,
        wrapper,
        document.options,
        context.scoring(),
    )?;
    info!(
        path = %path.display(),
        experiment = %scheduler.experiment().name,
        trials = scheduler.experiment().num_trials(),
        "snapshot loaded"
    );
    Ok(scheduler)
}

pub type WrapperFactory = Arc<dyn Fn(&WrapperDescriptor) -> TlResult<SharedWrapper> + Send + Sync>;

/// Registries consulted when decoding a snapshot.
#[derive(Clone)]
pub struct SerializationContext {
    wrappers: HashMap<String, WrapperFactory>,
    scoring: Arc<ScoringRegistry>,
}

impl SerializationContext {
    pub fn new(scoring: Arc<ScoringRegistry>) -> Self {
        Self {
            wrappers: HashMap::new(),
            scoring,
        }
    }

    /// Default scoring functions and the script wrapper.
    pub fn with_defaults() -> Self {
        let mut context = Self::new(Arc::new(ScoringRegistry::with_defaults()));
        context.register_wrapper(SCRIPT_WRAPPER_NAME, |descriptor| {
            Ok(Arc::new(ScriptWrapper::from_descriptor(descriptor)?) as SharedWrapper)
        });
        context
    }

    /// Replaces any factory already registered under `name`.
    pub fn register_wrapper<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&WrapperDescriptor) -> TlResult<SharedWrapper> + Send + Sync + 'static,
    {
        self.wrappers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn scoring(&self) -> Arc<ScoringRegistry> {
        self.scoring.clone()
    }

    pub fn wrapper_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.wrappers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build_wrapper(&self, descriptor: &WrapperDescriptor) -> TlResult<SharedWrapper> {
        let factory = self.wrappers.get(&descriptor.name).ok_or_else(|| ConfigError::UnknownWrapper {
            name: descriptor.name.clone(),
            path: descriptor.path.clone().unwrap_or_default(),
        })?;
        factory(descriptor)
    }
}

impl std::fmt::Debug for SerializationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationContext")
            .field("wrappers", &self.wrapper_names())
            .field("scoring", &self.scoring)
            .finish()
    }
}
