//! Container-orchestration backend.
//!
//! Every run re-asserts the namespace and the shared NFS storage chain with
//! `ensure`, then creates one job. Only the NFS volume's server address is
//! ever reconciled in place.

use crate::cluster::{ensure, ClusterApi, KubectlClient};
use crate::context::{BackendConfig, BackendKind, BackendSettings, OrchestratedSettings};
use crate::error::{DeployError, Result};
use crate::experiment::{
    check_env_names, random_suffix, slugify, Experiment, DNS_LABEL_MAX, RUN_SUFFIX_LEN,
};
use crate::manifests::{
    build_job, build_namespace, build_nfs_deployment, build_nfs_pv, build_nfs_pvc,
    build_nfs_service, build_storage_pvc, JobParams, ObjectKind, NFS_PVC_NAME, NFS_SERVER_NAME,
    STORAGE_PVC_NAME,
};
use crate::resources;
use crate::{Backend, RunReceipt};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Produces the image reference a job runs.
pub trait ImageBuilder {
    fn build_and_publish(&self, experiment: &Experiment) -> Result<String>;
}

/// An image built and pushed outside this tool.
#[derive(Debug, Clone)]
pub struct PrebuiltImage(pub String);

impl ImageBuilder for PrebuiltImage {
    fn build_and_publish(&self, _experiment: &Experiment) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(DeployError::configuration("image reference is empty"));
        }
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratedState {
    Unconfigured,
    NamespaceEnsured,
    StorageEnsured,
    Submitted,
}

pub struct OrchestratedBackend<A: ClusterApi> {
    settings: OrchestratedSettings,
    storage_dir: String,
    context_env: BTreeMap<String, String>,
    api: A,
    images: Box<dyn ImageBuilder>,
    state: OrchestratedState,
}

impl OrchestratedBackend<KubectlClient> {
    pub fn connect(config: &BackendConfig, images: Box<dyn ImageBuilder>) -> Result<Self> {
        let settings = orchestrated_settings(config)?;
        let api = KubectlClient::new(settings.kube_context.clone())?;
        Self::with_api(config, api, images)
    }
}

impl<A: ClusterApi> OrchestratedBackend<A> {
    pub fn with_api(config: &BackendConfig, api: A, images: Box<dyn ImageBuilder>) -> Result<Self> {
        Ok(Self {
            settings: orchestrated_settings(config)?.clone(),
            storage_dir: config.storage_dir.clone(),
            context_env: config.env.clone(),
            api,
            images,
            state: OrchestratedState::Unconfigured,
        })
    }

    pub fn state(&self) -> OrchestratedState {
        self.state
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn mount_path(&self) -> &str {
        self.settings
            .storage_mount
            .as_deref()
            .unwrap_or(&self.storage_dir)
    }

    pub fn run_experiment(&mut self, experiment: &Experiment) -> Result<RunReceipt> {
        self.state = OrchestratedState::Unconfigured;
        let limits =
            resources::orchestrated_limits(experiment.resources(), &self.settings.gpu_resource_name)?;
        check_env_names(&self.context_env)?;
        let namespace = namespace_for(experiment.project())?;
        let image = self.images.build_and_publish(experiment)?;

        self.ensure_namespace(&namespace)?;
        self.state = OrchestratedState::NamespaceEnsured;

        self.ensure_shared_storage(&namespace)?;
        self.state = OrchestratedState::StorageEnsured;

        let name = job_name(experiment, &random_suffix(RUN_SUFFIX_LEN));
        let mut env = self.context_env.clone();
        env.extend(experiment.merged_env());
        let job = build_job(JobParams {
            name: &name,
            image: &image,
            args: experiment.command().params(),
            env,
            claim_name: NFS_PVC_NAME,
            mount_path: self.mount_path(),
            limits,
        });
        let body = serde_json::to_value(&job)?;
        let created = self.api.create(ObjectKind::Job, Some(&namespace), &body)?;
        self.state = OrchestratedState::Submitted;
        info!(namespace = %namespace, job = %name, image = %image, "job submitted");

        let uid = created
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(RunReceipt {
            backend: BackendKind::Orchestrated,
            experiment: experiment.unique_name(),
            target: format!("{}/{}", namespace, name),
            submission: format!("job/{}", name),
            output: uid,
            submitted_at: Utc::now(),
        })
    }

    pub fn ensure_namespace(&mut self, namespace: &str) -> Result<()> {
        ensure(
            &mut self.api,
            ObjectKind::Namespace,
            None,
            namespace,
            &build_namespace(namespace),
        )?;
        Ok(())
    }

    /// Storage claim, NFS server, its service, the NFS volume pointing at
    /// the service address, and the many-writer claim jobs mount.
    pub fn ensure_shared_storage(&mut self, namespace: &str) -> Result<()> {
        let ns = Some(namespace);
        let size = resources::binary_quantity(&self.settings.default_pvc_size);
        ensure(
            &mut self.api,
            ObjectKind::PersistentVolumeClaim,
            ns,
            STORAGE_PVC_NAME,
            &build_storage_pvc(STORAGE_PVC_NAME, &size),
        )?;
        ensure(
            &mut self.api,
            ObjectKind::Deployment,
            ns,
            NFS_SERVER_NAME,
            &build_nfs_deployment(NFS_SERVER_NAME, STORAGE_PVC_NAME),
        )?;
        let service = ensure(
            &mut self.api,
            ObjectKind::Service,
            ns,
            NFS_SERVER_NAME,
            &build_nfs_service(NFS_SERVER_NAME),
        )?;
        let server_ip = cluster_ip(&service.object)?;
        debug!(server_ip = %server_ip, "nfs server address");

        let pv_name = format!("pvc-nfs-{}", namespace);
        let pv = ensure(
            &mut self.api,
            ObjectKind::PersistentVolume,
            None,
            &pv_name,
            &build_nfs_pv(&pv_name, &server_ip),
        )?;
        let current = pv
            .object
            .pointer("/spec/nfs/server")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if current != server_ip {
            warn!(
                volume = %pv_name,
                from = current,
                to = %server_ip,
                "nfs server address changed; patching volume"
            );
            self.api.patch(
                ObjectKind::PersistentVolume,
                None,
                &pv_name,
                &json!({ "spec": { "nfs": { "server": server_ip } } }),
            )?;
        }

        ensure(
            &mut self.api,
            ObjectKind::PersistentVolumeClaim,
            ns,
            NFS_PVC_NAME,
            &build_nfs_pvc(NFS_PVC_NAME),
        )?;
        Ok(())
    }
}

impl<A: ClusterApi> Backend for OrchestratedBackend<A> {
    fn kind(&self) -> BackendKind {
        BackendKind::Orchestrated
    }

    fn run(&mut self, experiment: &Experiment) -> Result<RunReceipt> {
        self.run_experiment(experiment)
    }
}

fn orchestrated_settings(config: &BackendConfig) -> Result<&OrchestratedSettings> {
    match &config.backend {
        BackendSettings::Orchestrated(settings) => Ok(settings),
        BackendSettings::Batch(_) => Err(DeployError::configuration(
            "context is not a container-orchestration context",
        )),
    }
}

fn cluster_ip(service: &Value) -> Result<String> {
    match service.pointer("/spec/clusterIP").and_then(Value::as_str) {
        Some(ip) if !ip.is_empty() && ip != "None" => Ok(ip.to_string()),
        _ => Err(DeployError::api_object(
            ObjectKind::Service.short(),
            NFS_SERVER_NAME,
            "service has no cluster IP",
        )),
    }
}

pub fn namespace_for(project: &str) -> Result<String> {
    let namespace = slugify(project);
    if namespace.is_empty() {
        return Err(DeployError::configuration(format!(
            "project {:?} does not yield a namespace name",
            project
        )));
    }
    Ok(namespace)
}

/// `<slug>-<suffix>`, with the slug shortened to keep a valid object name.
pub fn job_name(experiment: &Experiment, suffix: &str) -> String {
    let budget = DNS_LABEL_MAX.saturating_sub(suffix.len() + 1);
    let mut slug = experiment.slug().to_string();
    slug.truncate(budget);
    format!("{}-{}", slug.trim_end_matches('-'), suffix)
}
