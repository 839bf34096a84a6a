use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hp_actors::{PeriodicTask, StateManager, StatusPoller};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::app::Panel;

/// Start the background actors and block until SIGINT or SIGTERM.
pub async fn run(panel: Panel) -> Result<()> {
    let panel = Arc::new(panel);
    let actors = panel.host.settings.actors.clone();
    let state = Arc::new(StateManager::new());

    let (mut poller, mut snapshots) = StatusPoller::new(panel.host.services.clone(), state.clone(), 16);
    poller.start(Duration::from_secs(actors.status_interval_secs));

    let watch = tokio::spawn(async move {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    let down: Vec<&String> = snapshot
                        .iter()
                        .filter(|(_, s)| s.installed && !s.running)
                        .map(|(key, _)| key)
                        .collect();
                    if !down.is_empty() {
                        warn!(services = ?down, "Installed services not running");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status watcher lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut unit_refresh = PeriodicTask::new("unit-refresh");
    {
        let panel = panel.clone();
        let state = state.clone();
        unit_refresh.start(Duration::from_secs(actors.unit_refresh_secs), move || {
            let panel = panel.clone();
            let state = state.clone();
            async move {
                let statuses = panel.units.refresh_all().await;
                state.update_units(statuses).await;
            }
        });
    }

    let mut renewal = PeriodicTask::new("certificate-renewal");
    {
        let panel = panel.clone();
        let state = state.clone();
        renewal.start(Duration::from_secs(actors.renewal_interval_secs), move || {
            let panel = panel.clone();
            let state = state.clone();
            async move {
                let result = panel.websites.renew_certificates().await;
                if !result.success {
                    warn!(error = %result.error_text(), "Certificate renewal failed");
                }
                state.record_renewal(result).await;
            }
        });
    }

    info!("hostpanel actors running");
    shutdown_signal().await?;

    renewal.stop();
    unit_refresh.stop();
    poller.stop();
    watch.abort();
    info!("Actors stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = ctrl_c => {
                res?;
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("Received SIGINT, initiating graceful shutdown");
    }

    Ok(())
}
