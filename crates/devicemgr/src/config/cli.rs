use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device manager daemon
    Daemon(Box<DaemonArgs>),
    /// Ask a running daemon whether a vendor's plugin is registered
    Heartbeat(HeartbeatArgs),
}

#[derive(Parser, Clone, Debug)]
pub struct HeartbeatArgs {
    #[arg(help = "Vendor whose registration should be checked")]
    pub vendor: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = plugin_api::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the registration socket"
    )]
    pub socket_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_REGISTRY_SOCKET",
        default_value = plugin_api::KUBELET_SOCKET_NAME,
        help = "File name of the registration socket inside the socket directory"
    )]
    pub registry_socket: String,
}
