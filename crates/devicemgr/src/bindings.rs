//! Workload to device bindings
//!
//! Forward map: workload uid, then container name, then the device groups
//! granted to that container (one group per allocation). Reverse map: device
//! key to owning workload. A key is in the reverse map exactly when it sits
//! in one forward group.

use std::collections::HashMap;

use tracing::warn;

use crate::device::Device;
use crate::device::DeviceKey;
use crate::workload::WorkloadRef;

#[derive(Debug)]
struct WorkloadBindings {
    workload: WorkloadRef,
    containers: HashMap<String, Vec<Vec<Device>>>,
}

#[derive(Debug, Default)]
pub struct Bindings {
    pod2dev: HashMap<String, WorkloadBindings>,
    dev2pod: HashMap<DeviceKey, WorkloadRef>,
}

impl Bindings {
    /// Records `group` as granted to `container`. Devices already owned by
    /// someone are left out; the accepted devices are returned.
    pub fn bind(&mut self, workload: &WorkloadRef, container: &str, group: Vec<Device>) -> Vec<Device> {
        let mut accepted = Vec::with_capacity(group.len());
        for device in group {
            let key = device.key();
            if let Some(owner) = self.dev2pod.get(&key) {
                warn!(device = %key, owner = %owner, workload = %workload, "device already bound, ignoring");
                continue;
            }
            self.dev2pod.insert(key, workload.clone());
            accepted.push(device);
        }
        if accepted.is_empty() {
            return accepted;
        }

        self.pod2dev
            .entry(workload.uid.clone())
            .or_insert_with(|| WorkloadBindings {
                workload: workload.clone(),
                containers: HashMap::new(),
            })
            .containers
            .entry(container.to_string())
            .or_default()
            .push(accepted.clone());
        accepted
    }

    /// Records `group` only when none of its devices has an owner yet.
    /// Otherwise nothing changes and the first owned device is returned with
    /// its owner.
    pub fn bind_exclusive(
        &mut self,
        workload: &WorkloadRef,
        container: &str,
        group: Vec<Device>,
    ) -> Result<(), (DeviceKey, WorkloadRef)> {
        let taken = group.iter().find_map(|device| {
            let key = device.key();
            self.dev2pod.get(&key).map(|owner| (key, owner.clone()))
        });
        if let Some(taken) = taken {
            return Err(taken);
        }
        self.bind(workload, container, group);
        Ok(())
    }

    /// Number of groups currently granted to the container.
    pub fn group_count(&self, uid: &str, container: &str) -> usize {
        self.pod2dev
            .get(uid)
            .and_then(|w| w.containers.get(container))
            .map_or(0, Vec::len)
    }

    /// Drops every group past the first `keep` ones and returns their devices.
    pub fn truncate(&mut self, uid: &str, container: &str, keep: usize) -> Vec<Device> {
        let Some(groups) = self
            .pod2dev
            .get_mut(uid)
            .and_then(|w| w.containers.get_mut(container))
        else {
            return Vec::new();
        };
        if groups.len() <= keep {
            return Vec::new();
        }

        let removed: Vec<Device> = groups.drain(keep..).flatten().collect();
        self.forget(uid, container, &removed);
        removed
    }

    /// Drops the container's bindings and returns every device it held.
    pub fn unbind_container(&mut self, uid: &str, container: &str) -> Vec<Device> {
        self.truncate(uid, container, 0)
    }

    pub fn devices_for(&self, uid: &str, container: &str) -> Vec<Device> {
        self.pod2dev
            .get(uid)
            .and_then(|w| w.containers.get(container))
            .map(|groups| groups.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner(&self, key: &DeviceKey) -> Option<&WorkloadRef> {
        self.dev2pod.get(key)
    }

    pub fn workloads(&self) -> Vec<WorkloadRef> {
        self.pod2dev.values().map(|w| w.workload.clone()).collect()
    }

    pub fn is_bound(&self, key: &DeviceKey) -> bool {
        self.dev2pod.contains_key(key)
    }

    fn forget(&mut self, uid: &str, container: &str, devices: &[Device]) {
        for device in devices {
            let key = device.key();
            if self.dev2pod.get(&key).is_some_and(|owner| owner.uid == uid) {
                self.dev2pod.remove(&key);
            }
        }

        if let Some(workload) = self.pod2dev.get_mut(uid) {
            if workload.containers.get(container).is_some_and(Vec::is_empty) {
                workload.containers.remove(container);
            }
            if workload.containers.is_empty() {
                self.pod2dev.remove(uid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn gpu(name: &str) -> Device {
        Device::new("acme", "gpu", name)
    }

    fn names(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn bind_records_both_directions() {
        let mut bindings = Bindings::default();
        let w = WorkloadRef::new("uid-1", "default", "train");

        bindings.bind(&w, "main", vec![gpu("0"), gpu("1")]);
        bindings.bind(&w, "main", vec![gpu("2")]);

        assert_eq!(bindings.group_count("uid-1", "main"), 2);
        assert_eq!(names(&bindings.devices_for("uid-1", "main")), vec!["0", "1", "2"]);
        assert_eq!(bindings.owner(&gpu("1").key()), Some(&w));
        assert_eq!(bindings.workloads(), vec![w]);
    }

    #[test]
    fn device_cannot_belong_to_two_workloads() {
        let mut bindings = Bindings::default();
        let first = WorkloadRef::new("uid-1", "default", "a");
        let second = WorkloadRef::new("uid-2", "default", "b");

        bindings.bind(&first, "main", vec![gpu("0")]);
        let accepted = bindings.bind(&second, "main", vec![gpu("0"), gpu("1")]);

        assert_eq!(names(&accepted), vec!["1"]);
        assert_eq!(bindings.owner(&gpu("0").key()), Some(&first));
    }

    #[test]
    fn exclusive_bind_refuses_the_whole_group() {
        let mut bindings = Bindings::default();
        let first = WorkloadRef::new("uid-1", "default", "a");
        let second = WorkloadRef::new("uid-2", "default", "b");
        bindings.bind(&first, "main", vec![gpu("0")]);

        let refused = bindings.bind_exclusive(&second, "main", vec![gpu("1"), gpu("0")]);
        assert_eq!(refused, Err((gpu("0").key(), first.clone())));
        assert!(!bindings.is_bound(&gpu("1").key()));
        assert_eq!(bindings.group_count("uid-2", "main"), 0);

        assert_eq!(bindings.bind_exclusive(&second, "main", vec![gpu("1")]), Ok(()));
        assert_eq!(bindings.owner(&gpu("1").key()), Some(&second));
    }

    #[test]
    fn truncate_drops_only_later_groups() {
        let mut bindings = Bindings::default();
        let w = WorkloadRef::new("uid-1", "default", "train");
        bindings.bind(&w, "main", vec![gpu("0")]);
        bindings.bind(&w, "main", vec![gpu("1"), gpu("2")]);

        let removed = bindings.truncate("uid-1", "main", 1);
        assert_eq!(names(&removed), vec!["1", "2"]);
        assert_eq!(names(&bindings.devices_for("uid-1", "main")), vec!["0"]);
        assert!(!bindings.is_bound(&gpu("1").key()));
        assert!(bindings.is_bound(&gpu("0").key()));
    }

    #[test]
    fn unbinding_clears_reverse_entries_and_empty_workloads() {
        let mut bindings = Bindings::default();
        let w = WorkloadRef::new("uid-1", "default", "train");
        bindings.bind(&w, "main", vec![gpu("0")]);
        bindings.bind(&w, "sidecar", vec![gpu("1")]);

        assert_eq!(names(&bindings.unbind_container("uid-1", "main")), vec!["0"]);
        assert!(bindings.owner(&gpu("0").key()).is_none());
        assert_eq!(bindings.workloads().len(), 1);

        bindings.unbind_container("uid-1", "sidecar");
        assert!(bindings.workloads().is_empty());
        assert!(bindings.unbind_container("uid-1", "sidecar").is_empty());
    }
}
