//! Device data model
//!
//! A [`Device`] is the agent-side view of one hardware unit advertised by a
//! plugin. Its identity is the `(vendor, kind, name)` triple captured by
//! [`DeviceKey`]; everything else is descriptive except the health, which the
//! monitoring stream may flip to [`Health::Unhealthy`].

use std::collections::BTreeMap;

use plugin_api::v1alpha1 as api;
use serde::Deserialize;
use serde::Serialize;

/// Health of a device as reported by its plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(derive_more::Display)]
pub enum Health {
    #[default]
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

impl Health {
    /// Plugins that leave the field empty advertise a healthy device.
    pub fn from_wire(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case(plugin_api::UNHEALTHY) {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Health::Healthy => plugin_api::HEALTHY,
            Health::Unhealthy => plugin_api::UNHEALTHY,
        }
    }
}

/// Identity of a device. `name` is unique within `(vendor, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(derive_more::Display)]
#[display("{vendor}/{kind}/{name}")]
pub struct DeviceKey {
    pub vendor: String,
    pub kind: String,
    pub name: String,
}

impl DeviceKey {
    pub fn new(
        vendor: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub vendor: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub health: Health,
}

impl Device {
    pub fn new(vendor: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            kind: kind.into(),
            name: name.into(),
            properties: BTreeMap::new(),
            health: Health::Healthy,
        }
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.vendor, &self.kind, &self.name)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

impl From<api::Device> for Device {
    fn from(device: api::Device) -> Self {
        Self {
            health: Health::from_wire(&device.health),
            vendor: device.vendor,
            kind: device.kind,
            name: device.name,
            properties: device.properties.into_iter().collect(),
        }
    }
}

impl From<&Device> for api::Device {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name.clone(),
            kind: device.kind.clone(),
            vendor: device.vendor.clone(),
            properties: device
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            health: device.health.as_wire().to_string(),
        }
    }
}

/// Splits `devices` per vendor, keeping first-seen vendor order and the
/// relative order of devices inside each vendor.
pub fn group_by_vendor(devices: &[Device]) -> Vec<(String, Vec<Device>)> {
    let mut groups: Vec<(String, Vec<Device>)> = Vec::new();
    for device in devices {
        match groups.iter_mut().find(|(vendor, _)| *vendor == device.vendor) {
            Some((_, group)) => group.push(device.clone()),
            None => groups.push((device.vendor.clone(), vec![device.clone()])),
        }
    }
    groups
}
