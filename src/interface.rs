use std::sync::Arc;

use log::{error, info};
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
    app_context::AppState,
    battery::ChargePolicy,
    led::{LedChannel, LedMode},
    modem::{
        CommandError,
        ops::{self, Band, Rat},
    },
};

/// Control surface published on the bus for the web and CLI front ends.
pub struct GatewayInterface {
    pub state: Arc<AppState>,
    pub version: String,
}

impl GatewayInterface {
    pub fn new(state: Arc<AppState>, version: String) -> Self {
        Self { state, version }
    }
}

fn command_failed(e: CommandError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn failed(e: anyhow::Error) -> fdo::Error {
    error!("{e:#}");
    fdo::Error::Failed(format!("{e:#}"))
}

fn parse_channel(index: u8) -> fdo::Result<LedChannel> {
    LedChannel::from_index(index)
        .ok_or_else(|| fdo::Error::InvalidArgs(format!("no LED channel {index}")))
}

fn parse_rat(name: &str) -> fdo::Result<Rat> {
    match name.to_ascii_lowercase().as_str() {
        "lte" | "4g" => Ok(Rat::Lte),
        "nr" | "5g" => Ok(Rat::Nr),
        _ => Err(fdo::Error::InvalidArgs(format!("unknown RAT {name:?}"))),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

#[interface(name = "io.github.gatewayd1")]
impl GatewayInterface {
    #[zbus(signal)]
    pub async fn gesture_detected(emitter: &SignalEmitter<'_>, gesture: &str)
    -> zbus::Result<()>;

    /// Runs one AT command and returns the modem's raw answer.
    async fn execute_at(&self, command: String) -> fdo::Result<String> {
        self.state
            .command_bus
            .execute_text(&command)
            .await
            .map_err(command_failed)
    }

    async fn set_led_mode(&self, channel: u8, mode: u8) -> fdo::Result<()> {
        let channel = parse_channel(channel)?;
        let mode = LedMode::from_index(mode)
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("no LED mode {mode}")))?;
        self.state.leds.set_mode(channel, mode).map_err(failed)
    }

    async fn set_led_brightness(&self, channel: u8, brightness: u8) -> fdo::Result<()> {
        let channel = parse_channel(channel)?;
        self.state
            .leds
            .set_brightness(channel, brightness)
            .map_err(failed)
    }

    async fn all_leds_off(&self) -> fdo::Result<()> {
        self.state.leds.all_off().map_err(failed)
    }

    async fn refresh_leds(&self) -> fdo::Result<()> {
        self.state.leds.refresh().map_err(failed)
    }

    async fn set_wifi_requested(&self, requested: bool) -> fdo::Result<()> {
        let mut policy = self.state.leds.wifi_policy().await;
        policy.ap_requested = requested;
        info!("WiFi AP requested: {requested}");
        self.state.leds.set_wifi_policy(policy).map_err(failed)
    }

    async fn led_snapshot(&self) -> fdo::Result<String> {
        to_json(&self.state.leds.snapshot().await)
    }

    /// Capacity (0 when unknown) and whether the charger is active.
    async fn battery_status(&self) -> (u8, bool) {
        let info = self.state.charge_monitor.get_battery_status();
        (info.capacity.unwrap_or(0), info.is_charging())
    }

    async fn battery_info(&self) -> fdo::Result<String> {
        to_json(&self.state.charge_monitor.get_battery_status())
    }

    async fn set_charging(&self, enable: bool) -> fdo::Result<()> {
        self.state.charge_monitor.set_charging(enable).map_err(failed)
    }

    /// Validates and applies a charge policy, then persists it to the
    /// configuration file.
    async fn set_charge_policy(&self, enabled: bool, start: u8, stop: u8) -> fdo::Result<()> {
        let policy = ChargePolicy {
            enabled,
            start_threshold: start,
            stop_threshold: stop,
        };
        let monitor = &self.state.charge_monitor;
        monitor
            .set_policy(policy)
            .map_err(|e| fdo::Error::InvalidArgs(format!("{e:#}")))?;
        monitor.apply_policy(&monitor.get_battery_status());

        let config_manager = self.state.config_manager();
        config_manager.get_mut().await.battery.charge = policy;
        config_manager.save().await.map_err(failed)
    }

    async fn lock_bands(&self, bands: Vec<String>) -> fdo::Result<()> {
        let bands = bands
            .iter()
            .map(|name| {
                Band::from_name(name)
                    .ok_or_else(|| fdo::Error::InvalidArgs(format!("unknown band {name:?}")))
            })
            .collect::<fdo::Result<Vec<_>>>()?;
        ops::lock_bands(&self.state.command_bus, &bands)
            .await
            .map_err(command_failed)
    }

    async fn unlock_bands(&self) -> fdo::Result<()> {
        ops::unlock_bands(&self.state.command_bus)
            .await
            .map_err(command_failed)
    }

    async fn query_bands(&self) -> fdo::Result<String> {
        let masks = ops::query_bands(&self.state.command_bus)
            .await
            .map_err(command_failed)?;
        let locked: Vec<&str> = masks.locked_bands().into_iter().map(Band::name).collect();
        to_json(&serde_json::json!({ "masks": masks, "locked": locked }))
    }

    async fn lock_cell(&self, rat: String, arfcn: u32, pci: u16) -> fdo::Result<()> {
        let rat = parse_rat(&rat)?;
        ops::lock_cell(&self.state.command_bus, rat, arfcn, pci)
            .await
            .map_err(command_failed)
    }

    async fn unlock_cell(&self) -> fdo::Result<()> {
        ops::unlock_cell(&self.state.command_bus)
            .await
            .map_err(command_failed)
    }

    #[zbus(property)]
    async fn led_enabled(&self) -> bool {
        self.state.power_key.is_led_enabled()
    }

    #[zbus(property)]
    async fn version(&self) -> String {
        self.version.clone()
    }
}
