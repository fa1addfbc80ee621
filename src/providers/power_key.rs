use anyhow::{Result, bail};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::{app_context::AppState, providers::traits::ServiceProvider, task_manager::TaskManager};

/// Starts the power key reader thread. Key transitions go straight to the
/// LED loop, which classifies gestures.
///
/// # Priority and Criticality
///
/// - **Priority**: 8
/// - **Critical**: No (without an input device gestures are disabled)
pub struct PowerKeyServiceProvider {
    state: Arc<AppState>,
}

impl PowerKeyServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for PowerKeyServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let config = self.state.config().await.power_key.clone();
        if !config.enabled {
            info!("Power key disabled by configuration");
            return Ok(());
        }

        // The reader blocks in read(2) and exits once the loop drops its receiver.
        if self
            .state
            .power_key
            .start(&config.devices, config.key_code, self.state.key_tx.clone())
            .is_none()
        {
            bail!("no usable input device among {:?}", config.devices);
        }

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                cancel_token.cancelled().await;
                info!("Power key service cancelled");
                Ok(())
            })
            .await
    }

    fn name(&self) -> &'static str {
        "PowerKeyService"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn is_critical(&self) -> bool {
        false
    }
}
