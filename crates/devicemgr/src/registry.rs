//! Registration server
//!
//! Vendor plugins dial the well-known registration socket, announce the
//! socket they serve on, and are dialed back: handshake, full discovery, then
//! their devices and endpoint are installed in the [`Manager`]. Every refusal
//! travels back as a structured error inside the response.

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use plugin_api::v1alpha1 as api;
use plugin_api::v1alpha1::plugin_registration_server::PluginRegistration;
use plugin_api::v1alpha1::plugin_registration_server::PluginRegistrationServer;
use plugin_api::v1alpha1::HeartbeatStatus;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedMutex;

use crate::device::Device;
use crate::endpoint::PluginEndpoint;
use crate::error::DeviceManagerError;
use crate::error::Result;
use crate::manager::Manager;

const MAX_VENDOR_LEN: usize = 63;

/// Binds the registration socket and serves it until the manager stops.
pub fn serve(manager: Arc<Manager>) -> Result<JoinHandle<()>> {
    let path = manager.config().registry_socket_path();
    let listener_error = || DeviceManagerError::Listener {
        path: path.display().to_string(),
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).change_context_lazy(listener_error)?;
    }
    // left behind by a previous run
    if path.exists() {
        std::fs::remove_file(&path).change_context_lazy(listener_error)?;
    }
    let listener = UnixListener::bind(&path).change_context_lazy(listener_error)?;
    info!(path = %path.display(), "registration server listening");

    let token = manager.shutdown_token();
    let service = PluginRegistrationServer::new(RegistrationService::new(manager));

    Ok(tokio::spawn(async move {
        let served = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                token.cancelled().await;
                info!("shutting down registration server");
            })
            .await;
        if let Err(e) = served {
            error!("registration server failed: {e}");
        }
    }))
}

pub struct RegistrationService {
    manager: Arc<Manager>,
    locks: KeyedMutex<String>,
}

impl RegistrationService {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            locks: KeyedMutex::new(),
        }
    }

    async fn admit(&self, request: api::RegisterRequest) -> Result<()> {
        if request.version != plugin_api::VERSION {
            return Err(Report::new(DeviceManagerError::protocol("Unsupported version"))
                .attach_printable(format!("requested version: {}", request.version)));
        }
        let vendor = validate_vendor(&request.vendor)?;
        let socket = validate_socket_name(&request.unix_socket)?;

        let _guard = self.locks.lock(&vendor).await;

        if let Some(existing) = self.manager.endpoint(&vendor) {
            if existing.socket_name() != socket {
                return Err(Report::new(DeviceManagerError::Conflict {
                    vendor,
                    socket: existing.socket_name().to_string(),
                }));
            }
            info!(vendor = %vendor, "device plugin reconnecting");
            self.manager.remove_endpoint(&vendor);
            self.manager.delete_devices(&vendor).await;
        }

        let endpoint = PluginEndpoint::connect(&vendor, socket, self.manager.config()).await?;
        endpoint.start().await?;
        let devices = endpoint.discover().await?;
        check_vendor(&vendor, &devices)?;

        self.manager.install_devices(&vendor, devices).await;
        self.manager.install_endpoint(endpoint);
        Ok(())
    }
}

#[tonic::async_trait]
impl PluginRegistration for RegistrationService {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> core::result::Result<Response<api::RegisterResponse>, Status> {
        let request = request.into_inner();
        let vendor = request.vendor.clone();
        info!(vendor = %vendor, socket = %request.unix_socket, "device plugin registration");

        let error = match self.admit(request).await {
            Ok(()) => {
                info!(vendor = %vendor, "device plugin registered");
                None
            }
            Err(report) => {
                warn!(vendor = %vendor, "device plugin registration refused: {report:?}");
                Some(api::Error::new(report.current_context().to_string()))
            }
        };

        Ok(Response::new(api::RegisterResponse {
            version: plugin_api::VERSION.to_string(),
            error,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<api::HeartbeatRequest>,
    ) -> core::result::Result<Response<api::HeartbeatResponse>, Status> {
        let request = request.into_inner();

        let response = match validate_vendor(&request.vendor) {
            Err(report) => api::HeartbeatResponse {
                response: HeartbeatStatus::HeartbeatError as i32,
                error: Some(api::Error::new(report.current_context().to_string())),
            },
            Ok(vendor) if self.manager.endpoint(&vendor).is_some() => api::HeartbeatResponse {
                response: HeartbeatStatus::HeartbeatOk as i32,
                error: None,
            },
            Ok(_) => api::HeartbeatResponse {
                response: HeartbeatStatus::HeartbeatKo as i32,
                error: None,
            },
        };
        Ok(Response::new(response))
    }
}

/// Trims `vendor` and checks it is a usable identifier.
pub fn validate_vendor(vendor: &str) -> Result<String> {
    let vendor = vendor.trim();
    let invalid = |why: &str| {
        Err(Report::new(DeviceManagerError::protocol(format!(
            "Invalid vendor {vendor:?}: {why}"
        ))))
    };

    if vendor.is_empty() {
        return invalid("must not be empty");
    }
    if vendor.len() > MAX_VENDOR_LEN {
        return invalid("longer than 63 characters");
    }
    if !vendor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII alphanumerics, '-', '_' and '.' are allowed");
    }
    let bytes = vendor.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return invalid("must start and end with an alphanumeric character");
    }
    Ok(vendor.to_string())
}

fn validate_socket_name(socket: &str) -> Result<&str> {
    let plain = !socket.is_empty() && socket != "." && socket != ".." && !socket.contains('/');
    if plain {
        Ok(socket)
    } else {
        Err(Report::new(DeviceManagerError::protocol(format!(
            "Invalid socket name {socket:?}: must be a file name inside the device plugin directory"
        ))))
    }
}

fn check_vendor(vendor: &str, devices: &[Device]) -> Result<()> {
    match devices.iter().find(|d| d.vendor != vendor) {
        Some(device) => Err(Report::new(DeviceManagerError::protocol(format!(
            "Device {} does not belong to vendor {vendor}",
            device.key()
        )))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn vendor_is_trimmed() {
        assert_eq!(validate_vendor("  acme.io ").unwrap(), "acme.io");
        assert_eq!(validate_vendor("a").unwrap(), "a");
        assert_eq!(validate_vendor("nvidia_gpu-2").unwrap(), "nvidia_gpu-2");
    }

    #[test]
    fn malformed_vendors_are_refused() {
        let too_long = "a".repeat(64);
        for vendor in ["", "   ", "-acme", "acme.", "ac/me", "ac me", "äcme", too_long.as_str()] {
            let err = validate_vendor(vendor).unwrap_err();
            assert!(
                matches!(err.current_context(), DeviceManagerError::Protocol { .. }),
                "{vendor:?} should be refused"
            );
        }
        assert!(validate_vendor(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn socket_must_be_a_plain_file_name() {
        assert_eq!(validate_socket_name("acme.sock").unwrap(), "acme.sock");
        for socket in ["", ".", "..", "../kubelet.sock", "/tmp/acme.sock"] {
            assert!(validate_socket_name(socket).is_err(), "{socket:?}");
        }
    }

    #[test]
    fn foreign_devices_abort_registration() {
        let devices = vec![
            Device::new("acme", "gpu", "0"),
            Device::new("globex", "gpu", "1"),
        ];
        let err = check_vendor("acme", &devices).unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "Device globex/gpu/1 does not belong to vendor acme"
        );
        assert!(check_vendor("acme", &devices[..1]).is_ok());
    }
}
