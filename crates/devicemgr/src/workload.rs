//! Workload-side collaborators
//!
//! The device manager does not own workloads. It only needs to name them,
//! read which device resources a container asks for, and ask someone else to
//! terminate a workload whose device failed.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::device::DeviceKey;

/// Prefix of the resource names that designate device kinds.
pub const DEFAULT_RESOURCE_PREFIX: &str = "pod.alpha.kubernetes.io/opaque-int-resource-";

/// Legacy resource name that maps to the `nvidia-gpu` kind.
pub const NVIDIA_GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const NVIDIA_GPU_KIND: &str = "nvidia-gpu";

/// Failure reason attached to workloads terminated for a device failure.
pub const UNHEALTHY_DEVICE_REASON: &str = "UnhealthyDevice";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(derive_more::Display)]
#[display("{namespace}/{name}")]
pub struct WorkloadRef {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(
        uid: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Failed,
}

/// Status the terminator should record on the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    pub reason: String,
    pub message: String,
}

impl WorkloadStatus {
    pub fn unhealthy_device(device: &DeviceKey) -> Self {
        Self {
            phase: WorkloadPhase::Failed,
            reason: UNHEALTHY_DEVICE_REASON.to_string(),
            message: format!("device {device} became unhealthy"),
        }
    }
}

/// Terminates workloads on behalf of the device manager.
pub trait WorkloadTerminator: Send + Sync {
    fn terminate(&self, workload: &WorkloadRef, status: WorkloadStatus, grace_period_secs: i64);
}

/// Decides which container resources are devices, and of which kind.
pub trait ResourceFilter: Send + Sync {
    fn device_kind(&self, resource: &str) -> Option<String>;
}

/// Resources named `<prefix><kind>` are devices of `kind`.
#[derive(Debug, Clone)]
pub struct PrefixResourceFilter {
    prefix: String,
}

impl PrefixResourceFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PrefixResourceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_RESOURCE_PREFIX)
    }
}

impl ResourceFilter for PrefixResourceFilter {
    fn device_kind(&self, resource: &str) -> Option<String> {
        if resource == NVIDIA_GPU_RESOURCE {
            return Some(NVIDIA_GPU_KIND.to_string());
        }
        resource
            .strip_prefix(&self.prefix)
            .filter(|kind| !kind.is_empty())
            .map(str::to_string)
    }
}

/// Resource quantities of one container, already parsed to integers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub requests: BTreeMap<String, i64>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
}

impl ContainerResources {
    /// `(kind, count)` for every device resource, in resource name order.
    /// A device limit overrides the request of the same resource.
    pub fn device_requests(&self, filter: &dyn ResourceFilter) -> Vec<(String, i64)> {
        let mut requests = self.requests.clone();
        for (resource, limit) in &self.limits {
            if filter.device_kind(resource).is_some() {
                requests.insert(resource.clone(), *limit);
            }
        }

        requests
            .into_iter()
            .filter_map(|(resource, count)| filter.device_kind(&resource).map(|kind| (kind, count)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn prefix_filter_extracts_kind() {
        let filter = PrefixResourceFilter::default();

        assert_eq!(
            filter.device_kind("pod.alpha.kubernetes.io/opaque-int-resource-fpga"),
            Some("fpga".to_string())
        );
        assert_eq!(filter.device_kind("nvidia.com/gpu"), Some("nvidia-gpu".to_string()));
        assert_eq!(filter.device_kind("pod.alpha.kubernetes.io/opaque-int-resource-"), None);
        assert_eq!(filter.device_kind("cpu"), None);
    }

    #[test]
    fn limits_override_device_requests() {
        let resources = ContainerResources {
            requests: BTreeMap::from([
                ("cpu".to_string(), 2),
                ("nvidia.com/gpu".to_string(), 1),
            ]),
            limits: BTreeMap::from([
                ("memory".to_string(), 1024),
                ("nvidia.com/gpu".to_string(), 2),
                ("pod.alpha.kubernetes.io/opaque-int-resource-fpga".to_string(), 1),
            ]),
        };

        let requests = resources.device_requests(&PrefixResourceFilter::default());
        assert_eq!(
            requests,
            vec![
                ("nvidia-gpu".to_string(), 2),
                ("fpga".to_string(), 1),
            ]
        );
    }

    #[test]
    fn unhealthy_status_names_the_device() {
        let status = WorkloadStatus::unhealthy_device(&DeviceKey::new("acme", "gpu", "3"));
        assert_eq!(status.phase, WorkloadPhase::Failed);
        assert_eq!(status.reason, "UnhealthyDevice");
        assert!(status.message.contains("acme/gpu/3"));
    }
}
