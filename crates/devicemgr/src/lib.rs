//! Node-local device plugin manager
//!
//! Vendor plugins announce themselves on a well-known Unix socket, are
//! dialed back for their device inventory, and from then on allocate and
//! release devices on behalf of workload containers. The
//! [`handler::DevicePluginHandler`] is the entry point: it owns the
//! [`manager::Manager`] and the workload bindings, rebuilds them after a
//! restart, and escalates unhealthy devices to workload termination.

pub mod app;
pub mod bindings;
pub mod config;
pub mod container;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod inventory;
pub mod manager;
pub mod registry;
pub mod snapshot;
pub mod workload;

pub use container::ContainerConfig;
pub use device::Device;
pub use device::DeviceKey;
pub use device::Health;
pub use error::DeviceManagerError;
pub use handler::DevicePluginHandler;
pub use manager::Manager;
