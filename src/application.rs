use crate::{config::ConfigManager, coordinator::DeviceCoordinator};
use anyhow::{Result, anyhow};

/// The daemon: a coordinator plus the configuration it starts from.
///
/// # Example
///
/// ```no_run
/// use gatewayd::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// Application::builder()
///     .with_config_manager(config_manager)
///     .build()?
///     .run()
///     .await
/// # }
/// ```
pub struct Application {
    pub coordinator: DeviceCoordinator,
    config_manager: ConfigManager,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    /// Initializes, starts every service and blocks until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.coordinator
            .initialize(self.config_manager.clone())
            .await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }
}

#[derive(Default)]
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
}

impl ApplicationBuilder {
    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        Ok(Application {
            coordinator: DeviceCoordinator::new(),
            config_manager,
        })
    }
}
