//! Device plugin wire contract
//!
//! This crate carries the gRPC definitions shared by the node agent and the
//! out-of-process device plugins, together with the protocol constants both
//! sides agree on (supported version, socket locations, health values).

#![allow(clippy::doc_markdown)]
pub mod v1alpha1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("deviceplugin.v1alpha1");
}

use v1alpha1::Error;
use v1alpha1::RegisterResponse;

/// The single protocol version the registration server accepts.
pub const VERSION: &str = "0.1";

/// Directory holding the registration socket and every plugin socket.
pub const DEVICE_PLUGIN_PATH: &str = "/var/run/kubernetes/";

/// File name of the registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Health value advertised for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Health value advertised for a device that must not be handed out.
pub const UNHEALTHY: &str = "Unhealthy";

impl Error {
    /// Builds a structured protocol error carrying `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error: true,
            reason: reason.into(),
        }
    }
}

impl RegisterResponse {
    /// Returns the rejection reason, if the registration was refused.
    pub fn rejection(&self) -> Option<&str> {
        self.error
            .as_ref()
            .filter(|e| e.error)
            .map(|e| e.reason.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_none_without_error() {
        let response = RegisterResponse {
            version: VERSION.to_string(),
            error: None,
        };
        assert_eq!(response.rejection(), None);
    }

    #[test]
    fn rejection_carries_reason() {
        let response = RegisterResponse {
            version: VERSION.to_string(),
            error: Some(Error::new("Unsupported version")),
        };
        assert_eq!(response.rejection(), Some("Unsupported version"));
    }

    #[test]
    fn cleared_error_flag_is_not_a_rejection() {
        let response = RegisterResponse {
            version: VERSION.to_string(),
            error: Some(Error {
                error: false,
                reason: String::new(),
            }),
        };
        assert_eq!(response.rejection(), None);
    }
}
