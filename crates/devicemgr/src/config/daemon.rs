use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = plugin_api::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the registration socket and every device plugin socket"
    )]
    pub socket_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_REGISTRY_SOCKET",
        default_value = plugin_api::KUBELET_SOCKET_NAME,
        help = "File name of the registration socket inside the socket directory"
    )]
    pub registry_socket: String,

    #[arg(
        long,
        default_value = "10000",
        env = "DEVICE_PLUGIN_RPC_TIMEOUT_MS",
        help = "Upper bound for every call made to a device plugin, in milliseconds"
    )]
    pub rpc_timeout_ms: u64,

    #[arg(
        long,
        default_value = "5000",
        env = "DEVICE_PLUGIN_CONNECT_TIMEOUT_MS",
        help = "Upper bound for dialing a device plugin socket, in milliseconds"
    )]
    pub connect_timeout_ms: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "Delay before re-opening a closed health monitoring stream, in milliseconds"
    )]
    pub monitor_backoff_ms: u64,

    #[arg(
        long,
        default_value = "5000",
        help = "Delay between two attempts to hand devices back to their plugin, in milliseconds"
    )]
    pub dealloc_retry_ms: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "Delay between two checks for the workload terminator, in milliseconds"
    )]
    pub terminator_backoff_ms: u64,

    #[arg(
        long,
        default_value = "30",
        env = "UNHEALTHY_DEVICE_GRACE_PERIOD_SECS",
        help = "Grace period given to workloads terminated because of an unhealthy device"
    )]
    pub grace_period_secs: i64,

    #[arg(
        long,
        env = "DEVICE_RESOURCE_PREFIX",
        default_value = crate::workload::DEFAULT_RESOURCE_PREFIX,
        help = "Prefix identifying device resources in container requests"
    )]
    pub resource_prefix: String,

    #[arg(
        long,
        env = "DEVICE_STARTUP_SNAPSHOT",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON file describing device capacity and workload bindings recorded before a restart"
    )]
    pub snapshot_file: Option<PathBuf>,

    #[arg(
        long,
        env = "DEVICEMGR_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily, e.g. /logs/devicemgr.log"
    )]
    pub log_file: Option<PathBuf>,
}
