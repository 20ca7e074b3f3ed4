use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use plugin_api::v1alpha1 as api;
use plugin_api::v1alpha1::plugin_registration_client::PluginRegistrationClient;
use plugin_api::v1alpha1::HeartbeatStatus;

use crate::config::DaemonArgs;
use crate::config::HandlerConfig;
use crate::config::HeartbeatArgs;
use crate::config::ManagerConfig;
use crate::endpoint::connect_uds;
use crate::handler::DevicePluginHandler;
use crate::snapshot::StartupSnapshot;
use crate::workload::WorkloadRef;
use crate::workload::WorkloadStatus;
use crate::workload::WorkloadTerminator;

/// Stand-in terminator for a daemon running without a workload controller:
/// terminations are reported in the log only.
struct LoggingTerminator;

impl WorkloadTerminator for LoggingTerminator {
    fn terminate(&self, workload: &WorkloadRef, status: WorkloadStatus, grace_period_secs: i64) {
        tracing::warn!(
            workload = %workload,
            uid = %workload.uid,
            reason = %status.reason,
            grace_period_secs,
            "workload must be terminated: {}",
            status.message
        );
    }
}

pub async fn run_daemon(args: &DaemonArgs) -> Result<()> {
    let snapshot = match &args.snapshot_file {
        Some(path) => StartupSnapshot::load(path).map_err(|e| anyhow!("{e:?}"))?,
        None => StartupSnapshot::default(),
    };

    let handler = DevicePluginHandler::new(
        ManagerConfig::from(args),
        HandlerConfig::from(args),
        snapshot,
    )
    .map_err(|e| anyhow!("{e:?}"))?;
    handler.set_terminator(Arc::new(LoggingTerminator));

    wait_for_shutdown_signal().await?;

    tracing::info!("Shutdown signal received, stopping device manager");
    handler.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
    Ok(())
}

/// Asks the daemon whether `vendor` has a registered plugin.
pub async fn run_heartbeat(args: &HeartbeatArgs) -> Result<HeartbeatStatus> {
    let config = ManagerConfig {
        socket_dir: args.socket_dir.clone(),
        registry_socket: args.registry_socket.clone(),
        ..Default::default()
    };
    let path = config.registry_socket_path();

    let channel = connect_uds(&path, config.connect_timeout)
        .await
        .with_context(|| format!("failed to connect to {}", path.display()))?;
    let response = PluginRegistrationClient::new(channel)
        .heartbeat(api::HeartbeatRequest {
            vendor: args.vendor.clone(),
        })
        .await
        .context("heartbeat call failed")?
        .into_inner();

    let status = response.response();
    if let Some(error) = response.error.filter(|e| e.error) {
        tracing::warn!("heartbeat refused: {}", error.reason);
    }
    Ok(status)
}
