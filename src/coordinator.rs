//! Service lifecycle: builds the device state, starts providers in priority
//! order and reacts to bus events until SIGINT or SIGTERM arrives.

use std::{ops::ControlFlow, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{ConfigChangeType, Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, BatteryServiceProvider, ConfigWatcherServiceProvider,
        DBusServiceProvider, LedServiceProvider, NetworkServiceProvider, PowerKeyServiceProvider,
        ServiceProvider, WifiServiceProvider,
    },
    task_manager::TaskManager,
};

pub struct DeviceCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for DeviceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCoordinator {
    pub fn new() -> Self {
        Self::with_event_bus(EventBus::new())
    }

    pub fn with_event_bus(event_bus: EventBus) -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus,
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Builds the device state against the real hardware and registers every
    /// service.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing gatewayd...");
        config_manager
            .validate()
            .await
            .context("Invalid configuration")?;

        let state = AppStateProvider::new(config_manager, self.event_bus.clone())
            .provide()
            .await
            .context("Failed to initialize device state")?;
        self.attach(state).await
    }

    /// Registers the services around an already built state.
    pub async fn attach(&mut self, state: Arc<AppState>) -> Result<()> {
        self.shared_state = Some(state.clone());
        self.register_service_providers(state)
            .await
            .context("Failed to register service providers")
    }

    async fn register_service_providers(&mut self, state: Arc<AppState>) -> Result<()> {
        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(LedServiceProvider::new(state.clone())),
            Box::new(BatteryServiceProvider::new(state.clone())),
            Box::new(PowerKeyServiceProvider::new(state.clone())),
            Box::new(NetworkServiceProvider::new(state.clone())),
            Box::new(WifiServiceProvider::new(state.clone())),
            Box::new(ConfigWatcherServiceProvider::new(
                state.clone(),
                self.event_bus.clone(),
            )),
        ];

        if state.config().await.dbus.enabled {
            match DBusServiceProvider::new(state.clone(), self.event_bus.clone()).await {
                Ok(provider) => providers.push(Box::new(provider)),
                Err(e) => warn!("{e:#}, running without the D-Bus interface"),
            }
        } else {
            info!("D-Bus interface disabled by configuration");
        }

        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        self.service_providers = providers;
        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
        Ok(())
    }

    /// Starts services in priority order. Only a critical failure aborts.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (priority: {}, critical: {})",
                    provider.name(),
                    provider.priority(),
                    is_critical
                ),
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => warn!(
                    "Non-critical service '{}' failed to start: {e:#}",
                    provider.name()
                ),
            }
        }

        info!("All critical services started");
        Ok(())
    }

    /// Runs until SIGINT or SIGTERM, then stops every service.
    ///
    /// Failures while handling an event are logged and the loop carries on.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        info!("Entering main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        bail!("Failed to listen for Ctrl+C: {e}");
                    }
                    info!("Received Ctrl+C");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                event = event_rx.recv() => {
                    if self.handle_event(event).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn handle_event(&mut self, event: Result<Event, RecvError>) -> ControlFlow<()> {
        match event {
            Ok(Event::ConfigChangeDetected(change_type)) => {
                if let Err(e) = self.handle_config_change(change_type).await {
                    error!("Failed to handle config change: {e:#}");
                }
            }
            Ok(Event::StatusChanged(status)) => info!("Device status: {status:?}"),
            Ok(Event::GestureDetected(gesture)) => info!("Power key gesture: {}", gesture.as_str()),
            Ok(Event::ShutdownRequested) => {
                warn!("Power key shutdown requested, system shutdown is pending");
            }
            Err(RecvError::Closed) => {
                error!("Event bus closed unexpectedly");
                return ControlFlow::Break(());
            }
            Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
        }
        ControlFlow::Continue(())
    }

    async fn handle_config_change(&self, change_type: ConfigChangeType) -> Result<()> {
        match change_type {
            ConfigChangeType::HotReload => self.handle_hot_reload().await,
            ConfigChangeType::ColdRestart { changed_sections } => {
                warn!(
                    "Sections {changed_sections:?} only take effect after `systemctl restart gatewayd`"
                );
                Ok(())
            }
        }
    }

    /// Pushes the reloaded charge policy and WiFi flags into the running
    /// components. The watcher has already swapped the config in memory.
    async fn handle_hot_reload(&self) -> Result<()> {
        let state = self
            .shared_state
            .as_ref()
            .ok_or_else(|| anyhow!("Cannot reload config: device state not initialized"))?;
        let config = state.config_manager().clone_config().await;

        state
            .charge_monitor
            .set_policy(config.battery.charge)
            .context("Rejected charge policy")?;
        state
            .charge_monitor
            .apply_policy(&state.charge_monitor.get_battery_status());
        state.leds.set_wifi_policy(config.wifi.policy())?;

        info!("Hot configuration reload applied");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }
        info!("Shutdown complete");
        Ok(())
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registered_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app_context::testing::TestDevice, battery::ChargePolicy};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    async fn coordinator(device: &TestDevice) -> (DeviceCoordinator, Arc<AppState>) {
        let state = device.state().await;
        state.config_manager().get_mut().await.dbus.enabled = false;
        let mut coordinator = DeviceCoordinator::with_event_bus(device.event_bus.clone());
        assert_ok!(coordinator.attach(state.clone()).await);
        (coordinator, state)
    }

    #[tokio::test]
    async fn registers_services_by_priority() {
        let device = TestDevice::new();
        let (coordinator, _) = coordinator(&device).await;

        assert_eq!(
            coordinator.registered_services(),
            [
                "LedService",
                "BatteryService",
                "PowerKeyService",
                "NetworkService",
                "WifiService",
                "ConfigWatcherService",
            ]
        );
    }

    #[tokio::test]
    async fn missing_power_key_does_not_block_startup() {
        let device = TestDevice::new();
        let (mut coordinator, _) = coordinator(&device).await;

        assert_ok!(coordinator.start_all_services().await);
        assert!(!coordinator.task_manager.is_running("PowerKeyService"));
        assert!(coordinator.task_manager.is_running("LedService"));

        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn critical_failure_aborts_startup() {
        let device = TestDevice::new();
        let (mut coordinator, state) = coordinator(&device).await;
        // the LED loop can only be taken once
        let _stolen = state.take_aggregator().await.unwrap();

        let err = coordinator.start_all_services().await.unwrap_err();
        assert!(err.to_string().contains("LedService"));
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn hot_reload_applies_charge_and_wifi_policy() {
        let device = TestDevice::new();
        let (mut coordinator, state) = coordinator(&device).await;
        let mut aggregator = state.take_aggregator().await.unwrap();

        let policy = ChargePolicy {
            enabled: true,
            start_threshold: 70,
            stop_threshold: 90,
        };
        {
            let mut config = state.config_manager().get_mut().await;
            config.battery.charge = policy;
            config.wifi.ap_requested = false;
        }

        let flow = coordinator
            .handle_event(Ok(Event::ConfigChangeDetected(ConfigChangeType::HotReload)))
            .await;
        assert!(flow.is_continue());
        assert_eq!(state.charge_monitor.policy(), policy);

        // 64% is below the start threshold, so charging is switched on
        let switch = std::fs::read_to_string(device.dir.path().join("stop_charge")).unwrap();
        assert_eq!(switch, "0");

        loop {
            if let crate::aggregator::StatusEvent::Control(
                crate::aggregator::LedCommand::SetWifiPolicy(wifi),
            ) = aggregator.next_status_event().await
            {
                assert!(!wifi.ap_requested);
                break;
            }
        }
    }

    #[tokio::test]
    async fn invalid_hot_reload_is_reported() {
        let device = TestDevice::new();
        let (mut coordinator, state) = coordinator(&device).await;
        state.config_manager().get_mut().await.battery.charge = ChargePolicy {
            enabled: true,
            start_threshold: 90,
            stop_threshold: 10,
        };

        let flow = coordinator
            .handle_event(Ok(Event::ConfigChangeDetected(ConfigChangeType::HotReload)))
            .await;
        assert!(flow.is_continue());
        assert_ne!(state.charge_monitor.policy().start_threshold, 90);
    }

    #[tokio::test]
    async fn reload_after_led_loop_exit_keeps_running() {
        let device = TestDevice::new();
        let (mut coordinator, state) = coordinator(&device).await;
        drop(state.take_aggregator().await.unwrap());

        assert!(state.leds.set_wifi_policy(Default::default()).is_err());
        let flow = coordinator
            .handle_event(Ok(Event::ConfigChangeDetected(ConfigChangeType::HotReload)))
            .await;
        assert!(flow.is_continue());
    }

    #[tokio::test]
    async fn only_a_closed_bus_stops_the_loop() {
        let device = TestDevice::new();
        let (mut coordinator, _) = coordinator(&device).await;

        let cold = coordinator
            .handle_event(Ok(Event::ConfigChangeDetected(ConfigChangeType::ColdRestart {
                changed_sections: vec!["leds".to_string()],
            })))
            .await;
        assert!(cold.is_continue());

        let lagged = coordinator.handle_event(Err(RecvError::Lagged(3))).await;
        assert!(lagged.is_continue());

        let requested = coordinator.handle_event(Ok(Event::ShutdownRequested)).await;
        assert!(requested.is_continue());
        assert!(coordinator.handle_event(Err(RecvError::Closed)).await.is_break());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn main_loop_survives_failed_reload_and_exits_on_sigterm() {
        let device = TestDevice::new();
        let (mut coordinator, state) = coordinator(&device).await;
        coordinator.start_all_services().await.unwrap();
        state.config_manager().get_mut().await.battery.charge.start_threshold = 99;

        let bus = coordinator.event_bus().clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            bus.publish(Event::ConfigChangeDetected(ConfigChangeType::HotReload))
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        });

        tokio::time::timeout(std::time::Duration::from_secs(15), coordinator.run_main_loop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coordinator.task_manager.active_count(), 0);
    }
}
