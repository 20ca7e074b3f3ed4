#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use devicemgr::config::HandlerConfig;
use devicemgr::config::ManagerConfig;
use devicemgr::endpoint::connect_uds;
use devicemgr::snapshot::StartupSnapshot;
use devicemgr::workload::WorkloadRef;
use devicemgr::workload::WorkloadStatus;
use devicemgr::workload::WorkloadTerminator;
use devicemgr::DevicePluginHandler;
use futures::Stream;
use plugin_api::v1alpha1 as api;
use plugin_api::v1alpha1::device_manager_server::DeviceManager;
use plugin_api::v1alpha1::device_manager_server::DeviceManagerServer;
use plugin_api::v1alpha1::plugin_registration_client::PluginRegistrationClient;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

pub const REGISTRY_SOCKET: &str = "kubelet.sock";

/// Device plugin served over a Unix socket, recording the calls it gets.
pub struct MockPlugin {
    vendor: String,
    devices: Vec<api::Device>,
    health: broadcast::Sender<api::DeviceHealth>,
    fail_allocate: AtomicBool,
    fail_deallocate: AtomicBool,
    allocate_calls: AtomicUsize,
    deallocate_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    deallocated: Mutex<Vec<String>>,
    token: CancellationToken,
}

impl MockPlugin {
    pub fn device(vendor: &str, kind: &str, name: &str) -> api::Device {
        api::Device {
            name: name.to_string(),
            kind: kind.to_string(),
            vendor: vendor.to_string(),
            properties: Default::default(),
            health: plugin_api::HEALTHY.to_string(),
        }
    }

    /// Serves `devices` on `<dir>/<socket>`.
    pub fn serve(dir: &Path, socket: &str, vendor: &str, devices: Vec<api::Device>) -> Arc<Self> {
        let path = dir.join(socket);
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
        let listener = UnixListener::bind(&path).unwrap();

        let (health, _) = broadcast::channel(16);
        let plugin = Arc::new(Self {
            vendor: vendor.to_string(),
            devices,
            health,
            fail_allocate: AtomicBool::new(false),
            fail_deallocate: AtomicBool::new(false),
            allocate_calls: AtomicUsize::new(0),
            deallocate_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            deallocated: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        });

        let server = DeviceManagerServer::from_arc(Arc::clone(&plugin));
        let token = plugin.token.clone();
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(server)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled_owned())
                .await;
        });
        plugin
    }

    /// Serves `count` healthy devices named `0..count`.
    pub fn serve_kind(dir: &Path, socket: &str, vendor: &str, kind: &str, count: usize) -> Arc<Self> {
        let devices = (0..count)
            .map(|i| Self::device(vendor, kind, &i.to_string()))
            .collect();
        Self::serve(dir, socket, vendor, devices)
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deallocations(&self, fail: bool) {
        self.fail_deallocate.store(fail, Ordering::SeqCst);
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn deallocate_calls(&self) -> usize {
        self.deallocate_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn deallocated(&self) -> Vec<String> {
        self.deallocated.lock().unwrap().clone()
    }

    /// Number of open monitor streams.
    pub fn watchers(&self) -> usize {
        self.health.receiver_count()
    }

    pub fn report_unhealthy(&self, kind: &str, name: &str) {
        let vendor = self.vendor.clone();
        self.report_unhealthy_for(&vendor, kind, name);
    }

    /// Reports a device under an arbitrary vendor.
    pub fn report_unhealthy_for(&self, vendor: &str, kind: &str, name: &str) {
        let _ = self.health.send(api::DeviceHealth {
            name: name.to_string(),
            kind: kind.to_string(),
            vendor: vendor.to_string(),
            health: plugin_api::UNHEALTHY.to_string(),
        });
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl DeviceManager for MockPlugin {
    type DiscoverStream = ResponseStream<api::Device>;
    type MonitorStream = ResponseStream<api::DeviceHealth>;

    async fn start(&self, _request: Request<api::Empty>) -> Result<Response<api::Empty>, Status> {
        Ok(Response::new(api::Empty {}))
    }

    async fn stop(&self, _request: Request<api::Empty>) -> Result<Response<api::Empty>, Status> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(api::Empty {}))
    }

    async fn discover(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<Self::DiscoverStream>, Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        for device in &self.devices {
            let _ = tx.send(Ok(device.clone()));
        }
        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn monitor(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<Self::MonitorStream>, Status> {
        let mut health = self.health.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(record) = health.recv().await {
                if tx.send(Ok(record)).is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> Result<Response<api::AllocateResponse>, Status> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(Status::unavailable("allocation disabled"));
        }

        let names: Vec<String> = request
            .into_inner()
            .devices
            .into_iter()
            .map(|d| d.name)
            .collect();
        Ok(Response::new(api::AllocateResponse {
            envs: vec![api::KeyValue {
                key: format!("{}_VISIBLE_DEVICES", self.vendor.to_uppercase()),
                value: names.join(","),
            }],
            mounts: vec![api::Mount {
                name: "driver".to_string(),
                container_path: "/usr/local/driver".to_string(),
                host_path: format!("/opt/{}/driver", self.vendor),
                read_only: true,
            }],
            devices: vec![],
        }))
    }

    async fn deallocate(
        &self,
        request: Request<api::DeallocateRequest>,
    ) -> Result<Response<api::DeallocateResponse>, Status> {
        self.deallocate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deallocate.load(Ordering::SeqCst) {
            return Ok(Response::new(api::DeallocateResponse {
                error: Some(api::Error::new("device busy")),
            }));
        }
        self.deallocated
            .lock()
            .unwrap()
            .extend(request.into_inner().devices.into_iter().map(|d| d.name));
        Ok(Response::new(api::DeallocateResponse { error: None }))
    }
}

/// Terminator recording every call.
#[derive(Default)]
pub struct RecordingTerminator {
    calls: Mutex<Vec<(WorkloadRef, WorkloadStatus, i64)>>,
}

impl RecordingTerminator {
    pub fn calls(&self) -> Vec<(WorkloadRef, WorkloadStatus, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl WorkloadTerminator for RecordingTerminator {
    fn terminate(&self, workload: &WorkloadRef, status: WorkloadStatus, grace_period_secs: i64) {
        self.calls
            .lock()
            .unwrap()
            .push((workload.clone(), status, grace_period_secs));
    }
}

/// A handler serving its registration socket inside a temporary directory.
pub struct Node {
    pub dir: TempDir,
    pub handler: Arc<DevicePluginHandler>,
}

impl Node {
    pub fn start(snapshot: StartupSnapshot) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let manager_config = ManagerConfig {
            socket_dir: dir.path().to_path_buf(),
            registry_socket: REGISTRY_SOCKET.to_string(),
            rpc_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            monitor_backoff: Duration::from_millis(50),
        };
        let handler_config = HandlerConfig {
            dealloc_retry_delay: Duration::from_millis(50),
            terminator_backoff: Duration::from_millis(20),
            grace_period_secs: 30,
            ..Default::default()
        };

        let handler = DevicePluginHandler::new(manager_config, handler_config, snapshot).unwrap();
        Self { dir, handler }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.path().join(REGISTRY_SOCKET)
    }

    pub async fn registry_client(&self) -> PluginRegistrationClient<tonic::transport::Channel> {
        let channel = connect_uds(self.registry_path(), Duration::from_secs(1))
            .await
            .unwrap();
        PluginRegistrationClient::new(channel)
    }

    pub async fn register_with_version(
        &self,
        version: &str,
        socket: &str,
        vendor: &str,
    ) -> api::RegisterResponse {
        self.registry_client()
            .await
            .register(api::RegisterRequest {
                version: version.to_string(),
                unix_socket: socket.to_string(),
                vendor: vendor.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
    }

    pub async fn register(&self, socket: &str, vendor: &str) -> api::RegisterResponse {
        self.register_with_version(plugin_api::VERSION, socket, vendor)
            .await
    }

    pub async fn heartbeat(&self, vendor: &str) -> api::HeartbeatResponse {
        self.registry_client()
            .await
            .heartbeat(api::HeartbeatRequest {
                vendor: vendor.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
    }

    /// Names of the devices of `kind`, in table order.
    pub async fn device_names(&self, kind: &str) -> Vec<String> {
        names(self.handler.devices().await.get(kind))
    }

    pub async fn available_names(&self, kind: &str) -> Vec<String> {
        names(self.handler.available_devices().await.get(kind))
    }
}

pub fn names(devices: Option<&Vec<devicemgr::Device>>) -> Vec<String> {
    devices
        .map(|devices| devices.iter().map(|d| d.name.clone()).collect())
        .unwrap_or_default()
}

pub fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// [`wait_until`] for conditions that have to await.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
