use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::StatusEvent,
    app_context::AppState,
    network::{NetworkLatch, NetworkSample},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Polls signal strength and technology through the command bus and reports
/// network state changes to the LED loop.
///
/// # Priority and Criticality
///
/// - **Priority**: 7
/// - **Critical**: No
pub struct NetworkServiceProvider {
    state: Arc<AppState>,
}

impl NetworkServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for NetworkServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_network_service(state, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "NetworkService"
    }

    fn priority(&self) -> i32 {
        7
    }

    fn is_critical(&self) -> bool {
        false
    }
}

async fn run_network_service(state: Arc<AppState>, cancel_token: CancellationToken) -> Result<()> {
    let period = Duration::from_secs(state.config().await.modem.poll_interval_secs);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut refresh_rx = state.refresh_rx.clone();
    let mut latch = NetworkLatch::default();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Network service cancelled");
                break;
            }
            _ = ticker.tick() => {
                if refresh_rx.has_changed().unwrap_or(false) {
                    refresh_rx.mark_unchanged();
                    latch.reset();
                }

                let reading = state.command_bus.query_network().await;
                if let Err(e) = &reading {
                    debug!("Network query failed: {e}");
                }

                if let Some(sample) = latch.observe(NetworkSample::classify(&reading)) {
                    info!("Network state: {:?} (5G: {:?})", sample.state, sample.is_5g);
                    if state.status_tx.send(StatusEvent::Network(sample)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
