//! Shared device context.
//!
//! One [`AppState`] is built at startup and handed to every service. It owns
//! the hardware-facing components and the channels into the LED loop.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use log::debug;
use tokio::sync::{Mutex, mpsc, watch};

use crate::{
    aggregator::{AggregatorDeps, AggregatorSettings, LedController, StatusAggregator, StatusEvent},
    battery::{ChargeMonitor, ChargeSwitch},
    config::{Config, ConfigManager},
    event::EventBus,
    led::{LedSink, SysfsLeds},
    modem::{CommandBus, ModemEndpoint, ModemTransport, OfonoTransport},
    power_key::{GestureTiming, KeyEvent, PowerKeyMonitor},
    shell::{CommandRunner, ProcessRunner},
    wifi::WifiProbe,
};

/// Hardware seams, replaceable in tests.
pub struct Backends {
    pub modem: Arc<dyn ModemTransport>,
    pub leds: Box<dyn LedSink>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Backends {
    /// Telephony service over D-Bus, sysfs LEDs and real processes.
    pub fn system(config: &Config) -> Self {
        Self {
            modem: Arc::new(OfonoTransport::new(
                config.modem.service.clone(),
                ModemEndpoint::new(config.modem.default_endpoint.clone()),
            )),
            leds: Box::new(SysfsLeds::new(config.leds.sysfs_root.clone())),
            runner: Arc::new(ProcessRunner),
        }
    }
}

pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub command_bus: Arc<CommandBus>,
    pub charge_monitor: Arc<ChargeMonitor>,
    pub wifi_probe: Arc<WifiProbe>,
    pub power_key: PowerKeyMonitor,
    pub leds: LedController,
    pub status_tx: mpsc::UnboundedSender<StatusEvent>,
    pub key_tx: mpsc::UnboundedSender<KeyEvent>,
    pub refresh_rx: watch::Receiver<u64>,
    aggregator: Mutex<Option<StatusAggregator>>,
}

impl AppState {
    pub async fn new(config_manager: ConfigManager, event_bus: EventBus) -> Result<Self> {
        let backends = Backends::system(&*config_manager.get().await);
        Self::with_backends(config_manager, event_bus, backends).await
    }

    pub async fn with_backends(
        config_manager: ConfigManager,
        event_bus: EventBus,
        backends: Backends,
    ) -> Result<Self> {
        let config = config_manager.clone_config().await;

        let charge_monitor = Arc::new(ChargeMonitor::new(
            config.battery.uevent_path.clone(),
            ChargeSwitch::new(config.battery.stop_charge_path.clone()),
            config.battery.charge,
        ));
        let wifi_probe = Arc::new(WifiProbe::new(
            config.wifi.pid_files.clone(),
            config.wifi.proc_root.clone(),
        ));
        let power_key = PowerKeyMonitor::new();

        let aggregator = StatusAggregator::new(
            AggregatorDeps {
                sink: backends.leds,
                charge_monitor: charge_monitor.clone(),
                wifi_probe: wifi_probe.clone(),
                power_key: power_key.clone(),
                runner: backends.runner,
                event_bus,
            },
            AggregatorSettings {
                render_interval: config.leds.render_interval(),
                force_every: config.leds.force_rewrite_every,
                gesture: GestureTiming {
                    long_press: Duration::from_millis(config.power_key.long_press_ms),
                    double_click: Duration::from_millis(config.power_key.double_click_ms),
                },
                shutdown_delay: Duration::from_millis(config.power_key.shutdown_delay_ms),
                shutdown_command: config.power_key.shutdown_command.clone(),
                wifi_policy: config.wifi.policy(),
            },
        );

        let status_tx = aggregator.status_sender();
        let battery_tx = status_tx.clone();
        charge_monitor.register_callback(Box::new(move |info| {
            if battery_tx.send(StatusEvent::Battery(info.clone())).is_err() {
                debug!("LED loop gone, dropping battery update");
            }
        }));

        Ok(Self {
            command_bus: Arc::new(
                CommandBus::new(backends.modem)
                    .with_timeout(Duration::from_millis(config.modem.at_timeout_ms)),
            ),
            leds: aggregator.controller(),
            key_tx: aggregator.key_sender(),
            refresh_rx: aggregator.refresh_receiver(),
            status_tx,
            charge_monitor,
            wifi_probe,
            power_key,
            aggregator: Mutex::new(Some(aggregator)),
            config_manager: Arc::new(config_manager),
        })
    }

    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    /// Hands the LED loop to the service that runs it. Only the first call succeeds.
    pub async fn take_aggregator(&self) -> Result<StatusAggregator> {
        self.aggregator
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("Status aggregator already started"))
    }
}
