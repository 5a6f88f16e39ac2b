//! Translation of `Experiment.resources` into backend-native declarations.
//!
//! Every requested kind is validated up front so that an unknown kind aborts
//! the run before any remote call is made.

use crate::error::{DeployError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    Cpu,
    Gpu,
    Mem,
    Nodes,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Gpu => "gpu",
            ResourceKind::Mem => "mem",
            ResourceKind::Nodes => "nodes",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(ResourceKind::Cpu),
            "gpu" => Ok(ResourceKind::Gpu),
            "mem" => Ok(ResourceKind::Mem),
            "nodes" => Ok(ResourceKind::Nodes),
            other => Err(DeployError::UnsupportedResource {
                kind: other.to_string(),
            }),
        }
    }
}

/// Validated requests in a stable order (cpu, gpu, mem, nodes).
pub fn parse_requests(resources: &BTreeMap<String, String>) -> Result<Vec<(ResourceKind, String)>> {
    let mut requests = resources
        .iter()
        .map(|(kind, qty)| -> Result<(ResourceKind, String)> {
            Ok((kind.parse()?, qty.trim().to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    for (kind, qty) in &requests {
        if qty.is_empty() {
            return Err(DeployError::configuration(format!(
                "empty quantity for resource {}",
                kind
            )));
        }
    }
    requests.sort_by_key(|(kind, _)| *kind);
    Ok(requests)
}

/// CPU request spread across tasks, rounding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuAllocation {
    pub requested: u32,
    pub ntasks: u32,
    pub cores_per_task: u32,
}

impl CpuAllocation {
    pub fn plan(requested: u32, ntasks: u32) -> Result<Self> {
        if ntasks == 0 {
            return Err(DeployError::configuration("ntasks must be at least 1"));
        }
        let cores_per_task = requested / ntasks;
        if cores_per_task == 0 {
            return Err(DeployError::configuration(format!(
                "cannot spread {} cpu across {} tasks",
                requested, ntasks
            )));
        }
        Ok(Self {
            requested,
            ntasks,
            cores_per_task,
        })
    }

    pub fn total(&self) -> u32 {
        self.cores_per_task * self.ntasks
    }

    pub fn is_rounded(&self) -> bool {
        self.total() != self.requested
    }

    /// Emits the non-fatal warnings for this allocation; returns how many.
    pub fn warn(&self, recommended: u32) -> usize {
        let mut warnings = 0;
        if self.is_rounded() {
            warn!(
                requested = self.requested,
                effective = self.total(),
                "will request {} cpu instead of {}",
                self.total(),
                self.requested
            );
            warnings += 1;
        }
        if self.total() > recommended {
            warn!(
                effective = self.total(),
                recommended,
                "requested number of cpu is higher than recommended"
            );
            warnings += 1;
        }
        debug!(
            "using {}/{} cpu cores per_task/total",
            self.cores_per_task,
            self.total()
        );
        warnings
    }
}

fn parse_count(kind: ResourceKind, qty: &str) -> Result<u32> {
    qty.parse::<u32>().map_err(|_| {
        DeployError::configuration(format!(
            "resource {} expects a whole number, got {:?}",
            kind, qty
        ))
    })
}

/// Scheduler flags, e.g. `-c 3 -n 3 --gres gpu:1 --mem 8G --nodes 2`.
pub fn batch_flags(
    resources: &BTreeMap<String, String>,
    ntasks: u32,
    recommended_cpus: u32,
) -> Result<Vec<String>> {
    let mut flags = Vec::new();
    for (kind, qty) in parse_requests(resources)? {
        match kind {
            ResourceKind::Cpu => {
                let alloc = CpuAllocation::plan(parse_count(kind, &qty)?, ntasks)?;
                flags.push("-c".to_string());
                flags.push(alloc.cores_per_task.to_string());
                if alloc.ntasks > 1 {
                    flags.push("-n".to_string());
                    flags.push(alloc.ntasks.to_string());
                    debug!("running {} tasks", alloc.ntasks);
                }
                alloc.warn(recommended_cpus);
            }
            ResourceKind::Gpu => {
                flags.push("--gres".to_string());
                flags.push(format!("gpu:{}", qty));
            }
            ResourceKind::Mem => {
                flags.push("--mem".to_string());
                flags.push(qty);
            }
            ResourceKind::Nodes => {
                parse_count(kind, &qty)?;
                flags.push("--nodes".to_string());
                flags.push(qty);
            }
        }
    }
    Ok(flags)
}

/// Container limits keyed by cluster resource name.
pub fn orchestrated_limits(
    resources: &BTreeMap<String, String>,
    gpu_resource_name: &str,
) -> Result<BTreeMap<String, String>> {
    let mut limits = BTreeMap::new();
    for (kind, qty) in parse_requests(resources)? {
        match kind {
            ResourceKind::Cpu => {
                limits.insert("cpu".to_string(), qty);
            }
            ResourceKind::Gpu => {
                parse_count(kind, &qty)?;
                limits.insert(gpu_resource_name.to_string(), qty);
            }
            ResourceKind::Mem => {
                limits.insert("memory".to_string(), binary_quantity(&qty));
            }
            ResourceKind::Nodes => {
                return Err(DeployError::UnsupportedResource {
                    kind: kind.to_string(),
                })
            }
        }
    }
    Ok(limits)
}

/// `8G` -> `8Gi`. Quantities already binary, or plain byte counts, pass
/// through unchanged.
pub fn binary_quantity(qty: &str) -> String {
    match qty.chars().last() {
        Some(c) if "KMGTPE".contains(c) => format!("{}i", qty),
        _ => qty.to_string(),
    }
}
