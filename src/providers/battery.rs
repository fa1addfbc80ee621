use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    battery::{UeventSocket, is_battery_event},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Poll period when kernel events are unavailable.
const FALLBACK_POLL: Duration = Duration::from_secs(30);
const UEVENT_BUFFER: usize = 8192;

/// Watches kernel battery events, enforces the charge window and feeds the
/// LED loop through the charge monitor's subscribers.
///
/// # Priority and Criticality
///
/// - **Priority**: 9
/// - **Critical**: No (battery LEDs stay at their last state)
pub struct BatteryServiceProvider {
    state: Arc<AppState>,
}

impl BatteryServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for BatteryServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_battery_service(state, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "BatteryService"
    }

    fn priority(&self) -> i32 {
        9
    }

    fn is_critical(&self) -> bool {
        false
    }
}

async fn run_battery_service(state: Arc<AppState>, cancel_token: CancellationToken) -> Result<()> {
    let monitor = state.charge_monitor.clone();
    monitor.apply_policy(&monitor.get_battery_status());

    match UeventSocket::open() {
        Ok(socket) => {
            info!("Listening for battery uevents");
            let mut buf = vec![0u8; UEVENT_BUFFER];

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Battery service cancelled");
                        break;
                    }
                    received = socket.recv(&mut buf) => match received {
                        Ok(len) if is_battery_event(&buf[..len]) => {
                            monitor.handle_event();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("uevent receive failed: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        Err(e) => {
            warn!("{e:#}; polling battery every {FALLBACK_POLL:?}");
            poll_battery(&state, FALLBACK_POLL, cancel_token).await;
        }
    }

    Ok(())
}

async fn poll_battery(state: &AppState, period: Duration, cancel_token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; the reading was already delivered
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Battery polling cancelled");
                break;
            }
            _ = ticker.tick() => {
                let info = state.charge_monitor.handle_event();
                debug!("Battery poll: {:?}%", info.capacity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_context::testing::TestDevice;
    use crate::battery::ChargePolicy;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    #[tokio::test]
    async fn provider_metadata() {
        let device = TestDevice::new();
        let provider = BatteryServiceProvider::new(device.state().await);
        assert_eq!(provider.name(), "BatteryService");
        assert_eq!(provider.priority(), 9);
        assert!(!provider.is_critical());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_picks_up_battery_changes() {
        let device = TestDevice::new();
        let state = device.state().await;
        let mut aggregator = state.take_aggregator().await.unwrap();
        // drain the registration reading
        aggregator.next_status_event().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let state = state.clone();
            let cancel = cancel.clone();
            async move { poll_battery(&state, Duration::from_secs(5), cancel).await }
        });

        std::fs::write(
            device.dir.path().join("uevent"),
            "POWER_SUPPLY_STATUS=Charging\nPOWER_SUPPLY_CAPACITY=65\n",
        )
        .unwrap();
        sleep(Duration::from_secs(6)).await;

        match aggregator.next_status_event().await {
            crate::aggregator::StatusEvent::Battery(info) => {
                assert_eq!(info.key(), (Some(65), true));
            }
            other => panic!("unexpected event {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn startup_applies_charge_policy() {
        let device = TestDevice::new();
        std::fs::write(
            device.dir.path().join("uevent"),
            "POWER_SUPPLY_STATUS=Discharging\nPOWER_SUPPLY_CAPACITY=10\n",
        )
        .unwrap();
        let state = device.state().await;
        state
            .charge_monitor
            .set_policy(ChargePolicy {
                enabled: true,
                start_threshold: 20,
                stop_threshold: 80,
            })
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        run_battery_service(state, cancel).await.unwrap();

        let switch = std::fs::read_to_string(device.dir.path().join("stop_charge")).unwrap();
        assert_eq!(switch, "0");
    }
}
