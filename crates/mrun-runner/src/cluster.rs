//! Cluster API seam and the idempotent `ensure` primitive.
//!
//! `ensure` lists by exact name and creates only when absent. It never
//! updates an existing object; the few objects that need reconciliation are
//! patched explicitly by the caller.

use crate::error::{DeployError, Result};
use crate::manifests::ObjectKind;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::{debug, info};

pub trait ClusterApi {
    /// Objects of `kind` named exactly `name` (zero or one in practice).
    fn list(&mut self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<Vec<Value>>;

    /// Creates `body`. A name collision must surface as `AlreadyExists`.
    fn create(&mut self, kind: ObjectKind, namespace: Option<&str>, body: &Value) -> Result<Value>;

    fn patch(
        &mut self,
        kind: ObjectKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ensured {
    pub created: bool,
    pub object: Value,
}

/// Returns the existing object named `name`, or creates it from `body`.
///
/// Losing a creation race to a concurrent run is not an error: the object
/// created by the winner is read back and returned.
pub fn ensure<A, M>(
    api: &mut A,
    kind: ObjectKind,
    namespace: Option<&str>,
    name: &str,
    body: &M,
) -> Result<Ensured>
where
    A: ClusterApi + ?Sized,
    M: Serialize,
{
    if let Some(object) = api.list(kind, namespace, name)?.into_iter().next() {
        debug!(%kind, name, "already present");
        return Ok(Ensured {
            created: false,
            object,
        });
    }
    let body = serde_json::to_value(body)?;
    match api.create(kind, namespace, &body) {
        Ok(object) => {
            info!(%kind, name, "created");
            Ok(Ensured {
                created: true,
                object,
            })
        }
        Err(DeployError::AlreadyExists { .. }) => {
            debug!(%kind, name, "created concurrently; reading it back");
            let object = api
                .list(kind, namespace, name)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    DeployError::api_object(kind.short(), name, "reported as existing but not found")
                })?;
            Ok(Ensured {
                created: false,
                object,
            })
        }
        Err(err) => Err(err),
    }
}

/// `ClusterApi` backed by the `kubectl` binary.
pub struct KubectlClient {
    context: Option<String>,
}

impl KubectlClient {
    pub fn new(context: Option<String>) -> Result<Self> {
        let check = Command::new("kubectl")
            .args(["version", "--client"])
            .output()
            .map_err(|e| DeployError::configuration(format!("kubectl not available: {}", e)))?;
        if !check.status.success() {
            return Err(DeployError::configuration(format!(
                "kubectl not usable: {}",
                String::from_utf8_lossy(&check.stderr).trim()
            )));
        }
        Ok(Self { context })
    }

    fn base_args(&self, kind: ObjectKind, namespace: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if kind.is_namespaced() {
            if let Some(ns) = namespace {
                args.push("--namespace".to_string());
                args.push(ns.to_string());
            }
        }
        args
    }

    pub fn list_args(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Vec<String> {
        let mut args = self.base_args(kind, namespace);
        args.extend([
            "get".to_string(),
            kind.resource().to_string(),
            "--field-selector".to_string(),
            format!("metadata.name={}", name),
            "-o".to_string(),
            "json".to_string(),
        ]);
        args
    }

    pub fn create_args(&self, kind: ObjectKind, namespace: Option<&str>) -> Vec<String> {
        let mut args = self.base_args(kind, namespace);
        args.extend([
            "create".to_string(),
            "-f".to_string(),
            "-".to_string(),
            "-o".to_string(),
            "json".to_string(),
        ]);
        args
    }

    pub fn patch_args(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Vec<String> {
        let mut args = self.base_args(kind, namespace);
        args.extend([
            "patch".to_string(),
            kind.resource().to_string(),
            name.to_string(),
            "--type".to_string(),
            "merge".to_string(),
            "-p".to_string(),
            patch.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ]);
        args
    }

    fn exec(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(args = ?args, "kubectl");
        let mut child = Command::new("kubectl")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)?;
        }
        Ok(child.wait_with_output()?)
    }
}

fn object_name(body: &Value) -> &str {
    body.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
}

fn parse_object(kind: ObjectKind, name: &str, output: &Output) -> Result<Value> {
    serde_json::from_slice(&output.stdout).map_err(|e| {
        DeployError::api_object(kind.short(), name, format!("unreadable response: {}", e))
    })
}

fn failure(kind: ObjectKind, name: &str, output: &Output) -> DeployError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
        return DeployError::AlreadyExists {
            kind: kind.short().to_string(),
            name: name.to_string(),
        };
    }
    DeployError::api_object(kind.short(), name, stderr.trim())
}

impl ClusterApi for KubectlClient {
    fn list(&mut self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<Vec<Value>> {
        let output = self.exec(&self.list_args(kind, namespace, name), None)?;
        if !output.status.success() {
            return Err(failure(kind, name, &output));
        }
        let listed = parse_object(kind, name, &output)?;
        Ok(match listed.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    fn create(&mut self, kind: ObjectKind, namespace: Option<&str>, body: &Value) -> Result<Value> {
        let name = object_name(body);
        let payload = serde_json::to_vec(body)?;
        let output = self.exec(&self.create_args(kind, namespace), Some(&payload))?;
        if !output.status.success() {
            return Err(failure(kind, name, &output));
        }
        parse_object(kind, name, &output)
    }

    fn patch(
        &mut self,
        kind: ObjectKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let output = self.exec(&self.patch_args(kind, namespace, name, patch), None)?;
        if !output.status.success() {
            return Err(failure(kind, name, &output));
        }
        parse_object(kind, name, &output)
    }
}
