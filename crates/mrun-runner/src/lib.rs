pub mod batch;
pub mod cluster;
pub mod context;
pub mod error;
pub mod experiment;
pub mod manifests;
pub mod orchestrated;
pub mod packaging;
pub mod resources;
pub mod shell;

pub use batch::{BatchBackend, BatchState, ScratchLayout};
pub use cluster::{ensure, ClusterApi, Ensured, KubectlClient};
pub use context::{BackendConfig, BackendKind, BackendSettings, ConfigFile};
pub use error::{DeployError, Result};
pub use experiment::{CommandLine, Experiment, ExperimentSpec};
pub use orchestrated::{ImageBuilder, OrchestratedBackend, OrchestratedState, PrebuiltImage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A deployment target able to accept runs.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Provisions what the run needs and submits it once.
    fn run(&mut self, experiment: &Experiment) -> Result<RunReceipt>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReceipt {
    pub backend: BackendKind,
    pub experiment: String,
    /// Remote run directory, or `<namespace>/<job>`.
    pub target: String,
    pub submission: String,
    pub output: String,
    pub submitted_at: DateTime<Utc>,
}

/// Opens the backend a context describes. `images` is only consulted by the
/// container-orchestration backend.
pub fn open_backend(
    config: &BackendConfig,
    images: Option<Box<dyn ImageBuilder>>,
) -> Result<Box<dyn Backend>> {
    match config.kind() {
        BackendKind::Batch => Ok(Box::new(BatchBackend::connect(config)?)),
        BackendKind::Orchestrated => {
            let images = images.ok_or_else(|| {
                DeployError::configuration("container-orchestration runs need an image reference")
            })?;
            Ok(Box::new(OrchestratedBackend::connect(config, images)?))
        }
    }
}

/// Reads experiment records from a YAML or JSON file: a list, a single
/// record, or a mapping with an `experiments` list.
pub fn load_experiment_specs(path: &Path) -> Result<Vec<ExperimentSpec>> {
    let raw = fs::read_to_string(path)?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let records = match json_value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("experiments") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(DeployError::configuration(format!(
                    "{}: `experiments` must be a list",
                    path.display()
                )))
            }
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(DeployError::configuration(format!(
                "{}: expected an experiment record or a list of them",
                path.display()
            )))
        }
    };
    let specs = records
        .into_iter()
        .map(serde_json::from_value)
        .collect::<std::result::Result<Vec<ExperimentSpec>, _>>()?;
    if specs.is_empty() {
        return Err(DeployError::configuration(format!(
            "{}: no experiments defined",
            path.display()
        )));
    }
    debug!(count = specs.len(), path = %path.display(), "loaded experiment specs");
    Ok(specs)
}

/// Builds one `Experiment` per record. Each record's `cmd` becomes the
/// command line; `params` are appended after a `--` separator.
pub fn resolve_experiments(
    specs: Vec<ExperimentSpec>,
    params: &[String],
    working_directory: &Path,
) -> Result<Vec<Experiment>> {
    specs
        .into_iter()
        .map(|spec| {
            let cmd = spec
                .cmd
                .clone()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    DeployError::configuration(format!("experiment {:?} has no `cmd`", spec.name))
                })?;
            let command = CommandLine::new(command_text(&cmd, params));
            spec.build(command, working_directory)
        })
        .collect()
}

fn command_text(cmd: &str, params: &[String]) -> String {
    if params.is_empty() {
        return cmd.trim().to_string();
    }
    let quoted = shell::shell_join(params);
    if cmd.split_whitespace().any(|t| t == "--") {
        format!("{} {}", cmd.trim(), quoted)
    } else {
        format!("{} -- {}", cmd.trim(), quoted)
    }
}

/// Directory experiment paths are resolved against: the experiment file's parent.
pub fn spec_working_directory(spec_path: &Path) -> PathBuf {
    spec_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."))
}
