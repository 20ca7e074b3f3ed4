mod logging;

use anyhow::Result;
use clap::Parser;
use devicemgr::app;
use devicemgr::config::Cli;
use devicemgr::config::Commands;
use plugin_api::v1alpha1::HeartbeatStatus;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => {
            let _guard = logging::init(daemon_args.log_file.as_deref())?;
            tracing::info!("Starting device manager {}", &**version::VERSION);
            app::run_daemon(&daemon_args).await
        }
        Commands::Heartbeat(heartbeat_args) => {
            utils::logging::init();
            let status = app::run_heartbeat(&heartbeat_args).await?;
            println!("{}", status.as_str_name());
            if status != HeartbeatStatus::HeartbeatOk {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
