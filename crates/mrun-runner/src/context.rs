use crate::error::{DeployError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_RECOMMENDED_CPUS: u32 = 4;
pub const DEFAULT_PVC_SIZE: &str = "40G";
pub const DEFAULT_GPU_RESOURCE: &str = "nvidia.com/gpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Batch,
    Orchestrated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Batch => "batch",
            BackendKind::Orchestrated => "orchestrated",
        }
    }
}

/// Deployment target. Loaded once from the config file and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub storage_dir: String,
    pub user_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend_type", rename_all = "snake_case")]
pub enum BackendSettings {
    #[serde(alias = "slurm")]
    Batch(BatchSettings),
    #[serde(alias = "kubernetes")]
    Orchestrated(OrchestratedSettings),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self.backend {
            BackendSettings::Batch(_) => BackendKind::Batch,
            BackendSettings::Orchestrated(_) => BackendKind::Orchestrated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStyle {
    /// `srun`: blocks until the job finishes.
    Interactive,
    /// `sbatch`: queues the job and returns.
    Batched,
}

impl SubmitStyle {
    pub fn verb(&self) -> &'static str {
        match self {
            SubmitStyle::Interactive => "srun",
            SubmitStyle::Batched => "sbatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    pub slurm_url: String,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    pub scratch_dir: String,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub ntasks: Option<u32>,
    #[serde(default, deserialize_with = "words_or_list")]
    pub modules_to_load: Vec<String>,
    #[serde(default)]
    pub after_module_load_cmd: Option<String>,
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default)]
    pub log_output_path: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub batched: bool,
    #[serde(default = "default_recommended_cpus")]
    pub recommended_cpus: u32,
    #[serde(default = "default_true")]
    pub reuse_archive: bool,
}

impl BatchSettings {
    pub fn new(slurm_url: &str, scratch_dir: &str) -> Self {
        Self {
            slurm_url: slurm_url.to_string(),
            ssh_port: None,
            identity_file: None,
            scratch_dir: scratch_dir.to_string(),
            partition: None,
            account: None,
            time: None,
            ntasks: None,
            modules_to_load: Vec::new(),
            after_module_load_cmd: None,
            venv: None,
            log_output_path: None,
            interactive: true,
            batched: false,
            recommended_cpus: DEFAULT_RECOMMENDED_CPUS,
            reuse_archive: true,
        }
    }

    pub fn submit_style(&self) -> Result<SubmitStyle> {
        match (self.interactive, self.batched) {
            (true, false) => Ok(SubmitStyle::Interactive),
            (false, true) => Ok(SubmitStyle::Batched),
            (true, true) => Err(DeployError::configuration(
                "both interactive and batched submission selected; choose one",
            )),
            (false, false) => Err(DeployError::configuration(
                "no submission style selected; set `interactive` or `batched`",
            )),
        }
    }

    pub fn user_and_host(&self) -> Result<(&str, &str)> {
        match self.slurm_url.split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok((user, host)),
            _ => Err(DeployError::configuration(format!(
                "slurm_url must look like user@host, got {:?}",
                self.slurm_url
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratedSettings {
    pub registry_url: String,
    #[serde(default = "default_pvc_size")]
    pub default_pvc_size: String,
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource_name: String,
    #[serde(default)]
    pub kube_context: Option<String>,
    #[serde(default)]
    pub storage_mount: Option<String>,
}

impl OrchestratedSettings {
    pub fn new(registry_url: &str) -> Self {
        Self {
            registry_url: registry_url.to_string(),
            default_pvc_size: default_pvc_size(),
            gpu_resource_name: default_gpu_resource(),
            kube_context: None,
            storage_mount: None,
        }
    }
}

fn default_recommended_cpus() -> u32 {
    DEFAULT_RECOMMENDED_CPUS
}

fn default_true() -> bool {
    true
}

fn default_pvc_size() -> String {
    DEFAULT_PVC_SIZE.to_string()
}

fn default_gpu_resource() -> String {
    DEFAULT_GPU_RESOURCE.to_string()
}

fn words_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WordsOrList {
        Words(String),
        List(Vec<String>),
    }
    Ok(match WordsOrList::deserialize(deserializer)? {
        WordsOrList::Words(s) => s.split_whitespace().map(str::to_string).collect(),
        WordsOrList::List(v) => v,
    })
}

/// Persisted user configuration: named contexts plus the active one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub contexts: BTreeMap<String, BackendConfig>,
}

impl ConfigFile {
    /// A missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn select(&self, name: Option<&str>) -> Result<(&str, &BackendConfig)> {
        let name = name
            .or(self.current_context.as_deref())
            .ok_or_else(|| {
                DeployError::configuration(
                    "no context given and `current_context` is not set in the config",
                )
            })?;
        self.contexts
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| DeployError::configuration(format!("unknown context {:?}", name)))
    }
}
