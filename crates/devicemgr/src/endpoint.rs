//! Client side of one device plugin connection.

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use plugin_api::v1alpha1 as api;
use plugin_api::v1alpha1::device_manager_client::DeviceManagerClient;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tower::service_fn;
use tracing::debug;

use crate::config::ManagerConfig;
use crate::container::ContainerConfig;
use crate::device::Device;
use crate::error::DeviceManagerError;
use crate::error::Result;

/// Dials a gRPC server listening on the Unix socket at `path`.
pub async fn connect_uds(
    path: impl AsRef<Path>,
    connect_timeout: Duration,
) -> core::result::Result<Channel, tonic::transport::Error> {
    let socket_path: PathBuf = path.as_ref().to_path_buf();

    // the authority is a placeholder, the connector below ignores it
    Endpoint::from_static("http://tonic")
        .connect_timeout(connect_timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}

/// A live connection to the plugin in charge of one vendor.
#[derive(Debug)]
pub struct PluginEndpoint {
    vendor: String,
    socket_name: String,
    client: DeviceManagerClient<Channel>,
    rpc_timeout: Duration,
    token: CancellationToken,
}

impl PluginEndpoint {
    pub async fn connect(vendor: &str, socket_name: &str, config: &ManagerConfig) -> Result<Self> {
        let path = config.plugin_socket_path(socket_name);
        debug!(vendor, path = %path.display(), "dialing device plugin");

        let channel = connect_uds(&path, config.connect_timeout)
            .await
            .change_context(DeviceManagerError::transport(vendor, "dial"))
            .attach_printable_lazy(|| format!("socket: {}", path.display()))?;

        Ok(Self {
            vendor: vendor.to_string(),
            socket_name: socket_name.to_string(),
            client: DeviceManagerClient::new(channel),
            rpc_timeout: config.rpc_timeout,
            token: CancellationToken::new(),
        })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Cancelled when the endpoint is replaced or the manager stops.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn start(&self) -> Result<()> {
        let mut client = self.client.clone();
        self.unary("start", client.start(api::Empty {})).await?;
        Ok(())
    }

    /// Best effort: plugins that already went away are only logged.
    pub async fn stop(&self) {
        let mut client = self.client.clone();
        if let Err(report) = self.unary("stop", client.stop(api::Empty {})).await {
            debug!(vendor = %self.vendor, "failed to notify plugin of shutdown: {report:?}");
        }
    }

    /// Reads the plugin's whole inventory.
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let mut client = self.client.clone();
        let drain = async move {
            let mut stream = client.discover(api::Empty {}).await?.into_inner();
            let mut devices = Vec::new();
            while let Some(device) = stream.message().await? {
                devices.push(Device::from(device));
            }
            Ok::<_, Status>(devices)
        };

        match tokio::time::timeout(self.rpc_timeout, drain).await {
            Ok(Ok(devices)) => Ok(devices),
            Ok(Err(status)) => Err(self.rpc_failed("discover", &status)),
            Err(_) => Err(self.timed_out("discover")),
        }
    }

    pub async fn allocate(&self, devices: &[Device]) -> Result<ContainerConfig> {
        let mut client = self.client.clone();
        let request = api::AllocateRequest {
            devices: devices.iter().map(api::Device::from).collect(),
        };
        let response = self.unary("allocate", client.allocate(request)).await?;
        Ok(ContainerConfig::from(response))
    }

    pub async fn deallocate(&self, devices: &[Device]) -> Result<()> {
        let mut client = self.client.clone();
        let request = api::DeallocateRequest {
            devices: devices.iter().map(api::Device::from).collect(),
        };
        let response = self.unary("deallocate", client.deallocate(request)).await?;

        match response.error {
            Some(error) if error.error => Err(Report::new(DeviceManagerError::transport(
                &self.vendor,
                "deallocate",
            ))
            .attach_printable(format!("plugin refused: {}", error.reason))),
            _ => Ok(()),
        }
    }

    /// Opens the health stream. Reading it is left to the caller.
    pub async fn monitor(&self) -> Result<Streaming<api::DeviceHealth>> {
        let mut client = self.client.clone();
        self.unary("monitor", client.monitor(api::Empty {})).await
    }

    async fn unary<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = core::result::Result<Response<T>, Status>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(self.rpc_failed(operation, &status)),
            Err(_) => Err(self.timed_out(operation)),
        }
    }

    fn rpc_failed(&self, operation: &'static str, status: &Status) -> Report<DeviceManagerError> {
        Report::new(DeviceManagerError::transport(&self.vendor, operation))
            .attach_printable(format!("status: {status}"))
    }

    fn timed_out(&self, operation: &'static str) -> Report<DeviceManagerError> {
        Report::new(DeviceManagerError::transport(&self.vendor, operation))
            .attach_printable(format!("timed out after {:?}", self.rpc_timeout))
    }
}
