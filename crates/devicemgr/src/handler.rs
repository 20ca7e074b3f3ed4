//! Workload binding handler
//!
//! [`DevicePluginHandler`] is what the rest of the node agent talks to. It
//! allocates devices for workload containers through the [`Manager`], keeps
//! track of which container owns which devices, rebuilds that knowledge from
//! a [`StartupSnapshot`] after a restart, and asks the [`WorkloadTerminator`]
//! to fail workloads whose devices turn unhealthy.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::time::Duration;

use error_stack::Report;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bindings::Bindings;
use crate::config::HandlerConfig;
use crate::config::ManagerConfig;
use crate::container::ContainerConfig;
use crate::device::Device;
use crate::device::DeviceKey;
use crate::error::DeviceManagerError;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::manager::Manager;
use crate::registry;
use crate::snapshot::StartupSnapshot;
use crate::workload::ContainerResources;
use crate::workload::PrefixResourceFilter;
use crate::workload::ResourceFilter;
use crate::workload::WorkloadRef;
use crate::workload::WorkloadStatus;
use crate::workload::WorkloadTerminator;

pub struct DevicePluginHandler {
    manager: Arc<Manager>,
    bindings: Mutex<Bindings>,
    terminator: OnceLock<Arc<dyn WorkloadTerminator>>,
    filter: Arc<dyn ResourceFilter>,
    config: HandlerConfig,
    shutdown: CancellationToken,
}

impl DevicePluginHandler {
    /// Rebuilds the device state recorded in `snapshot`, then opens the
    /// registration socket.
    ///
    /// Recorded bindings whose devices are still part of the capacity are
    /// restored. Capacity devices that are neither free nor bound are handed
    /// back to the pool in the background.
    pub fn new(
        manager_config: ManagerConfig,
        config: HandlerConfig,
        snapshot: StartupSnapshot,
    ) -> Result<Arc<Self>> {
        let filter = Arc::new(PrefixResourceFilter::new(&config.resource_prefix));
        Self::with_filter(manager_config, config, snapshot, filter)
    }

    pub fn with_filter(
        manager_config: ManagerConfig,
        config: HandlerConfig,
        snapshot: StartupSnapshot,
        filter: Arc<dyn ResourceFilter>,
    ) -> Result<Arc<Self>> {
        let (inventory, bindings, orphans) = reconcile(snapshot);
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Manager::new(manager_config, inventory, health_tx));

        let handler = Arc::new(Self {
            manager: Arc::clone(&manager),
            bindings: Mutex::new(bindings),
            terminator: OnceLock::new(),
            filter,
            config,
            shutdown: CancellationToken::new(),
        });

        if !orphans.is_empty() {
            info!(count = orphans.len(), "releasing devices no workload claims");
            handler.release_in_background(orphans);
        }

        registry::serve(manager)?;

        let listener = Arc::clone(&handler);
        tokio::spawn(async move { listener.listen_for_health(health_rx).await });

        Ok(handler)
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Wires the collaborator that fails workloads. Only the first call has
    /// an effect; returns whether this one did.
    pub fn set_terminator(&self, terminator: Arc<dyn WorkloadTerminator>) -> bool {
        self.terminator.set(terminator).is_ok()
    }

    /// Allocates every device resource the container asks for.
    pub async fn allocate_devices(
        &self,
        workload: &WorkloadRef,
        container: &str,
        resources: &ContainerResources,
        config: &mut ContainerConfig,
    ) -> Result<()> {
        let requests = resources.device_requests(self.filter.as_ref());
        self.allocate_request(workload, container, &requests, config).await
    }

    /// Allocates `count` devices of `kind` to the container and merges the
    /// plugins' configuration into `config`.
    pub async fn allocate_for_container(
        &self,
        workload: &WorkloadRef,
        container: &str,
        kind: &str,
        count: i64,
        config: &mut ContainerConfig,
    ) -> Result<()> {
        let request = [(kind.to_string(), count)];
        self.allocate_request(workload, container, &request, config).await
    }

    /// Either every `(kind, count)` pair is granted, or none is: on failure
    /// the groups granted so far for this request are handed back.
    async fn allocate_request(
        &self,
        workload: &WorkloadRef,
        container: &str,
        requests: &[(String, i64)],
        config: &mut ContainerConfig,
    ) -> Result<()> {
        let before = self.bindings().group_count(&workload.uid, container);
        let mut granted = ContainerConfig::default();

        for (kind, count) in requests {
            let allocation = match self.manager.allocate(kind, *count).await {
                Ok(allocation) => allocation,
                Err(report) => {
                    let stranded = report.current_context().stranded().to_vec();
                    self.roll_back(workload, container, before, stranded).await;
                    return Err(report);
                }
            };
            if allocation.devices.is_empty() {
                granted.merge(allocation.config);
                continue;
            }

            let bound = self
                .bindings()
                .bind_exclusive(workload, container, allocation.devices.clone());
            if let Err((device, owner)) = bound {
                // devices bound elsewhere stay allocated to their owner
                let stranded: Vec<Device> = allocation
                    .devices
                    .into_iter()
                    .filter(|d| self.owner_of(&d.key()).is_none())
                    .collect();
                self.roll_back(workload, container, before, stranded).await;
                return Err(Report::new(DeviceManagerError::AlreadyBound { device, owner })
                    .attach_printable(format!("requested by {workload}, container {container}")));
            }
            granted.merge(allocation.config);
        }

        config.merge(granted);
        Ok(())
    }

    /// Hands back the groups granted to the container past the first `keep`
    /// ones together with `stranded`.
    async fn roll_back(&self, workload: &WorkloadRef, container: &str, keep: usize, stranded: Vec<Device>) {
        let mut release = self.bindings().truncate(&workload.uid, container, keep);
        release.extend(stranded);
        warn!(
            workload = %workload,
            container,
            releasing = release.len(),
            "device allocation failed, rolling back"
        );
        if let Err(e) = self.manager.deallocate(&release).await {
            warn!("rollback deallocation not acknowledged, retrying in background: {e:?}");
            self.notify_in_background(release);
        }
    }

    /// Unbinds the container and returns its devices in the background. The
    /// plugins are told again until they accept or the handler stops.
    pub fn deallocate_devices(&self, workload: &WorkloadRef, container: &str) -> JoinHandle<()> {
        let devices = self.bindings().unbind_container(&workload.uid, container);
        if !devices.is_empty() {
            info!(workload = %workload, container, count = devices.len(), "releasing container devices");
        }
        self.release_in_background(devices)
    }

    pub fn devices_for_container(&self, uid: &str, container: &str) -> Vec<Device> {
        self.bindings().devices_for(uid, container)
    }

    pub fn owner_of(&self, key: &DeviceKey) -> Option<WorkloadRef> {
        self.bindings().owner(key).cloned()
    }

    pub async fn devices(&self) -> HashMap<String, Vec<Device>> {
        self.manager.devices().await
    }

    pub async fn available_devices(&self) -> HashMap<String, Vec<Device>> {
        self.manager.available().await
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.manager.stop().await;
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        // the tables stay consistent even if a holder panicked
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release_in_background(&self, devices: Vec<Device>) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let token = self.shutdown.clone();
        let delay = self.config.dealloc_retry_delay;

        tokio::spawn(async move {
            if let Err(report) = manager.deallocate(&devices).await {
                warn!(count = devices.len(), "device deallocation not acknowledged, retrying in {delay:?}: {report:?}");
                retry_notification(&manager, &devices, &token, delay).await;
            }
        })
    }

    fn notify_in_background(&self, devices: Vec<Device>) {
        let manager = Arc::clone(&self.manager);
        let token = self.shutdown.clone();
        let delay = self.config.dealloc_retry_delay;
        tokio::spawn(async move { retry_notification(&manager, &devices, &token, delay).await });
    }

    #[tracing::instrument(skip_all)]
    async fn listen_for_health(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Device>) {
        loop {
            let device = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                device = events.recv() => match device {
                    Some(device) => device,
                    None => break,
                },
            };
            self.escalate(device);
        }
        debug!("health listener stopped");
    }

    fn escalate(self: &Arc<Self>, device: Device) {
        let key = device.key();
        let Some(owner) = self.owner_of(&key) else {
            debug!(device = %key, "unhealthy device is not bound, nothing to do");
            return;
        };
        warn!(device = %key, workload = %owner, "terminating workload using an unhealthy device");

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Some(terminator) = handler.terminator.get() {
                    terminator.terminate(
                        &owner,
                        WorkloadStatus::unhealthy_device(&key),
                        handler.config.grace_period_secs,
                    );
                    return;
                }
                debug!(workload = %owner, "workload terminator not wired yet");
                tokio::select! {
                    _ = handler.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(handler.config.terminator_backoff) => {}
                }
            }
        });
    }
}

/// Tells the plugins about an already applied release until they accept.
async fn retry_notification(
    manager: &Manager,
    devices: &[Device],
    token: &CancellationToken,
    delay: Duration,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("giving up device deallocation on shutdown");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match manager.notify_deallocate(devices).await {
            Ok(()) => return,
            Err(report) => {
                warn!(count = devices.len(), "device deallocation failed, retrying in {delay:?}: {report:?}");
            }
        }
    }
}

/// Seeds the device tables and the bindings from a snapshot. Returns the
/// devices that are allocated but claimed by nobody.
fn reconcile(snapshot: StartupSnapshot) -> (Inventory, Bindings, Vec<Device>) {
    let available: Vec<DeviceKey> = snapshot.available.iter().map(Device::key).collect();
    let capacity: HashMap<DeviceKey, Device> = snapshot
        .capacity
        .iter()
        .map(|d| (d.key(), d.clone()))
        .collect();

    let mut inventory = Inventory::seeded(snapshot.capacity, &available);
    let mut bindings = Bindings::default();

    for record in &snapshot.workloads {
        for container in &record.containers {
            // the capacity entry carries the health known before the restart
            let group: Vec<Device> = container
                .devices
                .iter()
                .filter_map(|d| capacity.get(&d.key()).cloned())
                .collect();
            if group.is_empty() {
                continue;
            }
            for device in bindings.bind(&record.workload, &container.name, group) {
                inventory.mark_allocated(&device.key());
            }
        }
    }

    let bound: HashSet<DeviceKey> = capacity
        .keys()
        .filter(|key| bindings.is_bound(key))
        .cloned()
        .collect();
    let orphans: Vec<Device> = inventory
        .allocated()
        .into_iter()
        .filter(|d| !bound.contains(&d.key()))
        .collect();

    debug!(
        capacity = capacity.len(),
        bound = bound.len(),
        orphans = orphans.len(),
        "reconciled startup snapshot"
    );
    (inventory, bindings, orphans)
}
