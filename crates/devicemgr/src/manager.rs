//! Device inventory manager
//!
//! [`Manager`] owns the authoritative device tables and the table of live
//! plugin endpoints. Allocation and deallocation hold the inventory lock
//! across the plugin call so the advertised availability always matches what
//! the plugins were told. Health changes reported by a plugin's monitor
//! stream are applied here and forwarded to whoever holds the receiving end of
//! the health channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use error_stack::Report;
use plugin_api::v1alpha1 as api;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ManagerConfig;
use crate::container::ContainerConfig;
use crate::device::group_by_vendor;
use crate::device::Device;
use crate::device::DeviceKey;
use crate::device::Health;
use crate::endpoint::PluginEndpoint;
use crate::error::DeviceManagerError;
use crate::error::Result;
use crate::inventory::Inventory;

/// Devices handed out by [`Manager::allocate`] and the configuration the
/// plugins returned for them.
#[derive(Debug, Default)]
pub struct Allocation {
    pub devices: Vec<Device>,
    pub config: ContainerConfig,
}

pub struct Manager {
    config: ManagerConfig,
    inventory: Mutex<Inventory>,
    endpoints: DashMap<String, Arc<PluginEndpoint>>,
    // released devices whose vendor had no plugin to tell
    pending: DashMap<String, Vec<Device>>,
    health_tx: mpsc::UnboundedSender<Device>,
    shutdown: CancellationToken,
}

impl Manager {
    /// Unhealthy devices are sent on `health_tx` as soon as a plugin reports
    /// them.
    pub fn new(
        config: ManagerConfig,
        inventory: Inventory,
        health_tx: mpsc::UnboundedSender<Device>,
    ) -> Self {
        Self {
            config,
            inventory: Mutex::new(inventory),
            endpoints: DashMap::new(),
            pending: DashMap::new(),
            health_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Cancelled by [`Manager::stop`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn endpoint(&self, vendor: &str) -> Option<Arc<PluginEndpoint>> {
        self.endpoints.get(vendor).map(|e| Arc::clone(e.value()))
    }

    /// Vendors with a live endpoint.
    pub fn vendors(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }

    /// Installs `endpoint` for its vendor and starts watching its health
    /// stream. A previous endpoint for the same vendor is cancelled.
    /// Deallocations that waited for this vendor are sent right after.
    pub fn install_endpoint(self: &Arc<Self>, endpoint: PluginEndpoint) {
        let endpoint = Arc::new(endpoint);
        let vendor = endpoint.vendor().to_string();

        if let Some(previous) = self.endpoints.insert(vendor.clone(), Arc::clone(&endpoint)) {
            previous.cancel();
        }
        info!(vendor = %vendor, socket = endpoint.socket_name(), "device plugin endpoint installed");

        if let Some((_, devices)) = self.pending.remove(&vendor) {
            self.spawn_pending_release(Arc::clone(&endpoint), devices);
        }
        self.spawn_monitor(endpoint);
    }

    /// Released devices of `vendor` still waiting for its plugin.
    pub fn pending_release(&self, vendor: &str) -> Vec<Device> {
        self.pending
            .get(vendor)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Drops the vendor's endpoint, cancelling its monitor.
    pub fn remove_endpoint(&self, vendor: &str) -> Option<Arc<PluginEndpoint>> {
        let (_, endpoint) = self.endpoints.remove(vendor)?;
        endpoint.cancel();
        Some(endpoint)
    }

    pub async fn add_device(&self, device: Device) {
        self.inventory.lock().await.add_device(device);
    }

    pub async fn delete_devices(&self, vendor: &str) -> usize {
        let removed = self.inventory.lock().await.delete_devices(vendor);
        info!(vendor, removed, "purged devices of vendor");
        removed
    }

    /// Replaces every device of `vendor` with `devices` in one step.
    pub async fn install_devices(&self, vendor: &str, devices: Vec<Device>) {
        let count = devices.len();
        self.inventory.lock().await.install_devices(vendor, devices);
        info!(vendor, count, "installed discovered devices");
    }

    /// Takes `count` devices of `kind` out of the pool and asks their plugins
    /// to prepare them.
    ///
    /// When a plugin call fails the devices stay out of the pool and are
    /// returned inside [`DeviceManagerError::AllocationFailed`]; the caller
    /// owns them and must hand them back with [`Manager::deallocate`].
    pub async fn allocate(&self, kind: &str, count: i64) -> Result<Allocation> {
        let mut inventory = self.inventory.lock().await;
        let devices = inventory.take_available(kind, count).map_err(Report::new)?;
        if devices.is_empty() {
            return Ok(Allocation::default());
        }
        debug!(kind, count, "devices taken from the pool");

        let mut config = ContainerConfig::default();
        for (vendor, group) in group_by_vendor(&devices) {
            let fragment = match self.endpoint(&vendor) {
                Some(endpoint) => endpoint.allocate(&group).await,
                None => Err(Report::new(DeviceManagerError::transport(&vendor, "allocate"))
                    .attach_printable("no device plugin registered for this vendor")),
            };

            match fragment {
                Ok(fragment) => config.merge(fragment),
                Err(report) => {
                    warn!(kind, vendor = %vendor, "device plugin allocation failed: {report:?}");
                    return Err(report.change_context(DeviceManagerError::AllocationFailed {
                        kind: kind.to_string(),
                        stranded: devices,
                    }));
                }
            }
        }
        drop(inventory);

        info!(
            kind,
            devices = ?devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "allocated devices"
        );
        Ok(Allocation { devices, config })
    }

    /// Hands `devices` back to the pool and notifies their plugins. Safe to
    /// repeat with the same devices.
    ///
    /// An error means the pool was updated but a plugin was not told; retry
    /// with [`Manager::notify_deallocate`], not with another release.
    pub async fn deallocate(&self, devices: &[Device]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }

        // held until every plugin has been told
        let mut inventory = self.inventory.lock().await;
        let released = inventory.release(devices);
        debug!(
            returned = released.returned,
            unhealthy = released.unhealthy,
            unknown = released.unknown,
            "devices released"
        );

        let result = self.notify_plugins(devices).await;
        drop(inventory);
        result
    }

    /// Repeats the plugin side of a [`Manager::deallocate`] without touching
    /// the pool. Devices claimed again in the meantime are left out.
    pub async fn notify_deallocate(&self, devices: &[Device]) -> Result<()> {
        let inventory = self.inventory.lock().await;
        let unclaimed: Vec<Device> = devices
            .iter()
            .filter(|d| !inventory.is_claimed(&d.key()))
            .cloned()
            .collect();
        if unclaimed.len() < devices.len() {
            debug!(
                skipped = devices.len() - unclaimed.len(),
                "devices allocated again, not notifying their release"
            );
        }

        let result = self.notify_plugins(&unclaimed).await;
        drop(inventory);
        result
    }

    // callers hold the inventory lock
    async fn notify_plugins(&self, devices: &[Device]) -> Result<()> {
        let mut failure: Option<Report<DeviceManagerError>> = None;
        for (vendor, group) in group_by_vendor(devices) {
            let Some(endpoint) = self.endpoint(&vendor) else {
                warn!(vendor = %vendor, count = group.len(), "no device plugin registered, deallocation deferred");
                self.defer_release(&vendor, group);
                continue;
            };
            if let Err(report) = endpoint.deallocate(&group).await {
                match failure.as_mut() {
                    Some(failure) => failure.extend_one(report),
                    None => failure = Some(report),
                }
            }
        }

        match failure {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }

    fn defer_release(&self, vendor: &str, devices: Vec<Device>) {
        let mut pending = self.pending.entry(vendor.to_string()).or_default();
        for device in devices {
            if !pending.iter().any(|d| d.key() == device.key()) {
                pending.push(device);
            }
        }
    }

    /// Every known device, per kind.
    pub async fn devices(&self) -> HashMap<String, Vec<Device>> {
        self.inventory.lock().await.devices()
    }

    /// Allocatable devices, per kind.
    pub async fn available(&self) -> HashMap<String, Vec<Device>> {
        self.inventory.lock().await.available()
    }

    pub async fn device(&self, key: &DeviceKey) -> Option<Device> {
        self.inventory.lock().await.get(key).cloned()
    }

    /// Applies one record of the monitor stream of `vendor`'s plugin. A
    /// plugin only speaks for its own vendor.
    pub async fn apply_health(&self, vendor: &str, record: api::DeviceHealth) {
        if !record.vendor.is_empty() && record.vendor != vendor {
            warn!(
                vendor,
                claimed = %record.vendor,
                device = %record.name,
                "dropping health report for a device of another vendor"
            );
            return;
        }
        let key = DeviceKey::new(vendor, &record.kind, &record.name);

        if Health::from_wire(&record.health) == Health::Healthy {
            debug!(device = %key, "ignoring healthy report, only discovery restores a device");
            return;
        }

        let changed = self.inventory.lock().await.mark_unhealthy(&key);
        let Some(device) = changed else {
            debug!(device = %key, "unhealthy report for unknown or already unhealthy device");
            return;
        };

        warn!(device = %key, "device became unhealthy");
        if self.health_tx.send(device).is_err() {
            debug!(device = %key, "nobody listens for health events");
        }
    }

    fn spawn_pending_release(self: &Arc<Self>, endpoint: Arc<PluginEndpoint>, devices: Vec<Device>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.release_pending(endpoint, devices).await })
    }

    #[tracing::instrument(skip_all, fields(vendor = %endpoint.vendor(), count = devices.len()))]
    async fn release_pending(&self, endpoint: Arc<PluginEndpoint>, devices: Vec<Device>) {
        let token = endpoint.token().clone();
        loop {
            match self.notify_deallocate(&devices).await {
                Ok(()) => {
                    info!("deferred deallocation delivered");
                    return;
                }
                Err(report) => warn!("deferred deallocation failed: {report:?}"),
            }
            tokio::select! {
                _ = token.cancelled() => {
                    self.defer_release(endpoint.vendor(), devices);
                    return;
                }
                _ = tokio::time::sleep(self.config.monitor_backoff) => {}
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, endpoint: Arc<PluginEndpoint>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.watch_health(endpoint).await })
    }

    #[tracing::instrument(skip_all, fields(vendor = %endpoint.vendor()))]
    async fn watch_health(&self, endpoint: Arc<PluginEndpoint>) {
        let token = endpoint.token().clone();
        loop {
            let opened = tokio::select! {
                _ = token.cancelled() => break,
                opened = endpoint.monitor() => opened,
            };

            match opened {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => return,
                        next = stream.message() => next,
                    };
                    match next {
                        Ok(Some(record)) => self.apply_health(endpoint.vendor(), record).await,
                        Ok(None) => {
                            debug!("monitor stream ended");
                            break;
                        }
                        Err(status) => {
                            warn!("monitor stream failed: {status}");
                            break;
                        }
                    }
                },
                Err(report) => warn!("failed to open monitor stream: {report:?}"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitor_backoff) => {}
            }
        }
        debug!("monitor task stopped");
    }

    /// Stops every monitor, tells every plugin to stop, and shuts the
    /// registration listener down.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let vendors = self.vendors();
        let endpoints: Vec<Arc<PluginEndpoint>> = vendors
            .iter()
            .filter_map(|vendor| self.remove_endpoint(vendor))
            .collect();
        futures::future::join_all(endpoints.iter().map(|e| e.stop())).await;

        let socket: PathBuf = self.config.registry_socket_path();
        if let Err(e) = std::fs::remove_file(&socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %socket.display(), "failed to remove registration socket: {e}");
            }
        }
        info!(plugins = endpoints.len(), "device manager stopped");
    }
}
