//! Cluster objects as plain serializable values, one builder per object.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const STORAGE_PVC_NAME: &str = "storage";
pub const NFS_SERVER_NAME: &str = "nfs-server";
pub const NFS_PVC_NAME: &str = "nfs";
pub const NFS_STORAGE_CLASS: &str = "nfs";
pub const NFS_SERVER_IMAGE: &str = "k8s.gcr.io/volume-nfs:0.8";
pub const NFS_EXPORT_PATH: &str = "/exports";
pub const NFS_PORTS: [(&str, u16); 3] = [("nfs", 2049), ("mountd", 20048), ("rpcbind", 111)];
pub const EXPERIMENT_VOLUME: &str = "experiment-storage";
const NFS_SERVER_VOLUME: &str = "nfs-server-volume";
const NFS_PLACEHOLDER_SIZE: &str = "1Mi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Namespace,
    PersistentVolumeClaim,
    Deployment,
    Service,
    PersistentVolume,
    Job,
}

impl ObjectKind {
    /// Resource name understood by `kubectl`.
    pub fn resource(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "namespace",
            ObjectKind::PersistentVolumeClaim => "persistentvolumeclaim",
            ObjectKind::Deployment => "deployment",
            ObjectKind::Service => "service",
            ObjectKind::PersistentVolume => "persistentvolume",
            ObjectKind::Job => "job",
        }
    }

    pub fn short(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "ns",
            ObjectKind::PersistentVolumeClaim => "pvc",
            ObjectKind::Deployment => "dep",
            ObjectKind::Service => "svc",
            ObjectKind::PersistentVolume => "pv",
            ObjectKind::Job => "job",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace | ObjectKind::PersistentVolume)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PvcSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    pub access_modes: Vec<String>,
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub persistent_volume_claim: ClaimSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSource {
    pub claim_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub ports: Vec<ServicePort>,
    pub selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolume {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PvSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvSpec {
    pub capacity: BTreeMap<String, String>,
    pub access_modes: Vec<String>,
    pub storage_class_name: String,
    pub persistent_volume_reclaim_policy: String,
    pub nfs: NfsSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsSource {
    pub server: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub template: PodTemplate,
    pub backoff_limit: u32,
}

fn nfs_labels() -> BTreeMap<String, String> {
    [("role".to_string(), "nfs-server".to_string())]
        .into_iter()
        .collect()
}

fn storage_request(size: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: [("storage".to_string(), size.to_string())]
            .into_iter()
            .collect(),
        limits: BTreeMap::new(),
    }
}

pub fn build_namespace(name: &str) -> Namespace {
    Namespace {
        api_version: "v1".to_string(),
        kind: "Namespace".to_string(),
        metadata: ObjectMeta::named(name),
    }
}

/// Single-writer claim backing the NFS export. `size` is already a cluster
/// quantity (`40Gi`).
pub fn build_storage_pvc(name: &str, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        metadata: ObjectMeta::named(name),
        spec: PvcSpec {
            access_modes: vec!["ReadWriteOnce".to_string()],
            resources: storage_request(size),
            storage_class_name: None,
        },
    }
}

pub fn build_nfs_deployment(name: &str, storage_claim: &str) -> Deployment {
    let container = Container {
        name: name.to_string(),
        image: NFS_SERVER_IMAGE.to_string(),
        args: Vec::new(),
        env: Vec::new(),
        ports: NFS_PORTS
            .iter()
            .map(|(port_name, port)| ContainerPort {
                name: port_name.to_string(),
                container_port: *port,
            })
            .collect(),
        volume_mounts: vec![VolumeMount {
            name: NFS_SERVER_VOLUME.to_string(),
            mount_path: NFS_EXPORT_PATH.to_string(),
        }],
        resources: None,
        security_context: Some(SecurityContext { privileged: true }),
    };
    Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            labels: nfs_labels(),
        },
        spec: DeploymentSpec {
            replicas: 1,
            selector: LabelSelector {
                match_labels: nfs_labels(),
            },
            template: PodTemplate {
                metadata: Some(ObjectMeta {
                    name: String::new(),
                    labels: nfs_labels(),
                }),
                spec: PodSpec {
                    restart_policy: None,
                    containers: vec![container],
                    volumes: vec![Volume {
                        name: NFS_SERVER_VOLUME.to_string(),
                        persistent_volume_claim: ClaimSource {
                            claim_name: storage_claim.to_string(),
                        },
                    }],
                },
            },
        },
    }
}

pub fn build_nfs_service(name: &str) -> Service {
    Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata: ObjectMeta::named(name),
        spec: ServiceSpec {
            ports: NFS_PORTS
                .iter()
                .map(|(port_name, port)| ServicePort {
                    name: port_name.to_string(),
                    port: *port,
                })
                .collect(),
            selector: nfs_labels(),
        },
    }
}

/// Cluster-wide many-writer volume pointing at the NFS service address.
pub fn build_nfs_pv(name: &str, server: &str) -> PersistentVolume {
    PersistentVolume {
        api_version: "v1".to_string(),
        kind: "PersistentVolume".to_string(),
        metadata: ObjectMeta::named(name),
        spec: PvSpec {
            capacity: [("storage".to_string(), NFS_PLACEHOLDER_SIZE.to_string())]
                .into_iter()
                .collect(),
            access_modes: vec!["ReadWriteMany".to_string()],
            storage_class_name: NFS_STORAGE_CLASS.to_string(),
            persistent_volume_reclaim_policy: "Delete".to_string(),
            nfs: NfsSource {
                server: server.to_string(),
                path: "/".to_string(),
            },
        },
    }
}

pub fn build_nfs_pvc(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        metadata: ObjectMeta::named(name),
        spec: PvcSpec {
            access_modes: vec!["ReadWriteMany".to_string()],
            resources: storage_request(NFS_PLACEHOLDER_SIZE),
            storage_class_name: Some(NFS_STORAGE_CLASS.to_string()),
        },
    }
}

pub struct JobParams<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub claim_name: &'a str,
    pub mount_path: &'a str,
    pub limits: BTreeMap<String, String>,
}

/// One-shot job: never restarted, never retried by the cluster.
pub fn build_job(params: JobParams<'_>) -> Job {
    let container = Container {
        name: params.name.to_string(),
        image: params.image.to_string(),
        args: params.args,
        env: params
            .env
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect(),
        ports: Vec::new(),
        volume_mounts: vec![VolumeMount {
            name: EXPERIMENT_VOLUME.to_string(),
            mount_path: params.mount_path.to_string(),
        }],
        resources: Some(ResourceRequirements {
            requests: BTreeMap::new(),
            limits: params.limits,
        }),
        security_context: None,
    };
    Job {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta::named(params.name),
        spec: JobSpec {
            template: PodTemplate {
                metadata: None,
                spec: PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: vec![Volume {
                        name: EXPERIMENT_VOLUME.to_string(),
                        persistent_volume_claim: ClaimSource {
                            claim_name: params.claim_name.to_string(),
                        },
                    }],
                },
            },
            backoff_limit: 0,
        },
    }
}
