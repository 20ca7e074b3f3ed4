pub mod cli;
pub mod daemon;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the registration server, the plugin clients and the inventory.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding the registration socket and every plugin socket.
    pub socket_dir: PathBuf,
    /// File name of the registration socket inside `socket_dir`.
    pub registry_socket: String,
    /// Bound on every unary plugin call and on the discovery drain.
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    /// Delay before re-opening a monitor stream that ended or failed.
    pub monitor_backoff: Duration,
}

impl ManagerConfig {
    pub fn registry_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.registry_socket)
    }

    pub fn plugin_socket_path(&self, socket_name: impl AsRef<Path>) -> PathBuf {
        self.socket_dir.join(socket_name)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(plugin_api::DEVICE_PLUGIN_PATH),
            registry_socket: plugin_api::KUBELET_SOCKET_NAME.to_string(),
            rpc_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            monitor_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&daemon::DaemonArgs> for ManagerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            socket_dir: args.socket_dir.clone(),
            registry_socket: args.registry_socket.clone(),
            rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            monitor_backoff: Duration::from_millis(args.monitor_backoff_ms),
        }
    }
}

/// Settings of the workload binding handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Delay between two attempts to hand released devices back.
    pub dealloc_retry_delay: Duration,
    /// Delay between two checks for the workload terminator.
    pub terminator_backoff: Duration,
    pub grace_period_secs: i64,
    pub resource_prefix: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            dealloc_retry_delay: Duration::from_secs(5),
            terminator_backoff: Duration::from_secs(1),
            grace_period_secs: 30,
            resource_prefix: crate::workload::DEFAULT_RESOURCE_PREFIX.to_string(),
        }
    }
}

impl From<&daemon::DaemonArgs> for HandlerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            dealloc_retry_delay: Duration::from_millis(args.dealloc_retry_ms),
            terminator_backoff: Duration::from_millis(args.terminator_backoff_ms),
            grace_period_secs: args.grace_period_secs.max(0),
            resource_prefix: args.resource_prefix.clone(),
        }
    }
}

pub use cli::*;
pub use daemon::*;
