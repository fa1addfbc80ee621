use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::StatusEvent, app_context::AppState, providers::traits::ServiceProvider,
    task_manager::TaskManager, wifi::WifiLatch,
};

/// Checks access-point liveness on a timer and reports transitions.
///
/// # Priority and Criticality
///
/// - **Priority**: 7
/// - **Critical**: No
pub struct WifiServiceProvider {
    state: Arc<AppState>,
}

impl WifiServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for WifiServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_wifi_service(state, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "WifiService"
    }

    fn priority(&self) -> i32 {
        7
    }

    fn is_critical(&self) -> bool {
        false
    }
}

async fn run_wifi_service(state: Arc<AppState>, cancel_token: CancellationToken) -> Result<()> {
    let period = Duration::from_secs(state.config().await.wifi.poll_interval_secs);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut refresh_rx = state.refresh_rx.clone();
    let mut latch = WifiLatch::default();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("WiFi service cancelled");
                break;
            }
            _ = ticker.tick() => {
                if refresh_rx.has_changed().unwrap_or(false) {
                    refresh_rx.mark_unchanged();
                    latch.reset();
                }

                if let Some(alive) = latch.observe(state.wifi_probe.is_alive()) {
                    info!("Access point {}", if alive { "running" } else { "down" });
                    if state.status_tx.send(StatusEvent::Wifi(alive)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
