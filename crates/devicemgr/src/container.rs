//! Container launch configuration returned by plugins on allocation.

use plugin_api::v1alpha1 as api;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub name: String,
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

/// Device node exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

/// Everything the container runtime needs to expose allocated devices.
///
/// Fragments from several plugins are merged by appending; nothing is ever
/// deduplicated or overwritten, so a later plugin cannot shadow an earlier
/// one's entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub envs: Vec<EnvVar>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceNode>,
}

impl ContainerConfig {
    pub fn merge(&mut self, fragment: ContainerConfig) {
        self.envs.extend(fragment.envs);
        self.mounts.extend(fragment.mounts);
        self.devices.extend(fragment.devices);
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty() && self.mounts.is_empty() && self.devices.is_empty()
    }
}

impl From<api::AllocateResponse> for ContainerConfig {
    fn from(response: api::AllocateResponse) -> Self {
        Self {
            envs: response
                .envs
                .into_iter()
                .map(|kv| EnvVar {
                    key: kv.key,
                    value: kv.value,
                })
                .collect(),
            mounts: response
                .mounts
                .into_iter()
                .map(|m| Mount {
                    name: m.name,
                    container_path: m.container_path,
                    host_path: m.host_path,
                    read_only: m.read_only,
                })
                .collect(),
            devices: response
                .devices
                .into_iter()
                .map(|d| DeviceNode {
                    container_path: d.container_path,
                    host_path: d.host_path,
                    permissions: d.permissions,
                })
                .collect(),
        }
    }
}
