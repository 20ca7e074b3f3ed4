//! State recorded outside the agent before it restarted.

use std::path::Path;

use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::device::Device;
use crate::error::DeviceManagerError;
use crate::error::Result;
use crate::workload::WorkloadRef;

/// Devices recorded on one container of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub workload: WorkloadRef,
    #[serde(default)]
    pub containers: Vec<ContainerRecord>,
}

/// What the node reported before the restart: its device capacity, which of
/// those devices were free, and which workload containers held the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupSnapshot {
    #[serde(default)]
    pub capacity: Vec<Device>,
    #[serde(default)]
    pub available: Vec<Device>,
    #[serde(default)]
    pub workloads: Vec<WorkloadRecord>,
}

impl StartupSnapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let error = || DeviceManagerError::Snapshot {
            path: path.display().to_string(),
        };

        let raw = std::fs::read(path).change_context_lazy(error)?;
        serde_json::from_slice(&raw).change_context_lazy(error)
    }
}
