use core::error::Error;

use crate::device::Device;
use crate::device::DeviceKey;
use crate::workload::WorkloadRef;

/// Errors raised by the device manager and surfaced to its callers.
#[derive(Debug, derive_more::Display)]
pub enum DeviceManagerError {
    /// Malformed or unsupported request from a plugin.
    #[display("{reason}")]
    Protocol { reason: String },
    #[display("Not enough devices of kind {kind}: requested {requested}, available {available}")]
    ResourceExhausted {
        kind: String,
        requested: i64,
        available: usize,
    },
    #[display("Device plugin for vendor {vendor} failed during {operation}")]
    Transport {
        vendor: String,
        operation: &'static str,
    },
    /// `stranded` devices were taken out of the pool and must be handed back
    /// with a deallocation.
    #[display("Failed to allocate devices of kind {kind}, {} left outside the pool", stranded.len())]
    AllocationFailed { kind: String, stranded: Vec<Device> },
    #[display("Device {device} is already bound to workload {owner}")]
    AlreadyBound { device: DeviceKey, owner: WorkloadRef },
    #[display("A device plugin is already in charge of this vendor on socket {socket}")]
    Conflict { vendor: String, socket: String },
    #[display("Failed to serve registration socket {path}")]
    Listener { path: String },
    #[display("Failed to load startup snapshot {path}")]
    Snapshot { path: String },
}

impl Error for DeviceManagerError {}

impl DeviceManagerError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn transport(vendor: impl Into<String>, operation: &'static str) -> Self {
        Self::Transport {
            vendor: vendor.into(),
            operation,
        }
    }

    /// Devices the caller has to give back after a failed allocation.
    pub fn stranded(&self) -> &[Device] {
        match self {
            Self::AllocationFailed { stranded, .. } => stranded,
            _ => &[],
        }
    }
}

pub type Result<T> = core::result::Result<T, error_stack::Report<DeviceManagerError>>;

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn display_formatting() {
        assert_eq!(
            DeviceManagerError::protocol("Unsupported version").to_string(),
            "Unsupported version"
        );

        let exhausted = DeviceManagerError::ResourceExhausted {
            kind: "gpu".to_string(),
            requested: 5,
            available: 2,
        };
        assert_eq!(
            exhausted.to_string(),
            "Not enough devices of kind gpu: requested 5, available 2"
        );

        let conflict = DeviceManagerError::Conflict {
            vendor: "acme".to_string(),
            socket: "acme.sock".to_string(),
        };
        assert_eq!(
            conflict.to_string(),
            "A device plugin is already in charge of this vendor on socket acme.sock"
        );

        let failed = DeviceManagerError::AllocationFailed {
            kind: "gpu".to_string(),
            stranded: vec![Device::new("acme", "gpu", "0")],
        };
        assert_eq!(
            failed.to_string(),
            "Failed to allocate devices of kind gpu, 1 left outside the pool"
        );
        assert_eq!(failed.stranded().len(), 1);

        let bound = DeviceManagerError::AlreadyBound {
            device: DeviceKey::new("acme", "gpu", "0"),
            owner: WorkloadRef::new("uid-1", "default", "train"),
        };
        assert_eq!(
            bound.to_string(),
            "Device acme/gpu/0 is already bound to workload default/train"
        );
        assert!(exhausted.stranded().is_empty());
    }
}
