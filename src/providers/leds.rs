use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::{app_context::AppState, providers::traits::ServiceProvider, task_manager::TaskManager};

/// Runs the status aggregator: the render loop that owns the LEDs.
///
/// # Priority and Criticality
///
/// - **Priority**: 10 (highest, producers need it running)
/// - **Critical**: Yes
pub struct LedServiceProvider {
    state: Arc<AppState>,
}

impl LedServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for LedServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let aggregator = self.state.take_aggregator().await?;

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| {
                aggregator.run(cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "LedService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app_context::testing::TestDevice, led::LedChannel};
    use tokio::time::{Duration, sleep};

    #[tokio::test(start_paused = true)]
    async fn service_claims_and_paints_leds() {
        let device = TestDevice::new();
        let state = device.state().await;
        let provider = LedServiceProvider::new(state.clone());
        let mut task_manager = TaskManager::new();

        provider.start(&mut task_manager).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(device.sink.claimed.lock().unwrap().len(), 10);
        let snapshot = state.leds.snapshot().await;
        assert_eq!(snapshot.status.battery_capacity, Some(64));
        assert_eq!(device.sink.last(LedChannel::BatteryGreen), Some(1));

        task_manager.shutdown_all().await.unwrap();
        assert_eq!(device.sink.last(LedChannel::BatteryGreen), Some(0));
    }

    #[tokio::test]
    async fn second_start_fails() {
        let device = TestDevice::new();
        let state = device.state().await;
        let provider = LedServiceProvider::new(state);
        let mut task_manager = TaskManager::new();

        provider.start(&mut task_manager).await.unwrap();
        assert!(provider.start(&mut task_manager).await.is_err());
        assert_eq!(task_manager.active_count(), 1);
        task_manager.shutdown_all().await.unwrap();
    }
}
