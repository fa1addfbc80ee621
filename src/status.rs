//! Device status snapshot and the rules that turn it into LED modes.
//!
//! Every rule is a pure function of [`DeviceStatus`]; the aggregator decides
//! when to apply them.

use serde::{Deserialize, Serialize};

use crate::led::{LedChannel, LedMode};

/// Capacity below which the battery is reported as low.
pub const LOW_BATTERY_PERCENT: u8 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum NetworkState {
    /// The modem could not be queried.
    #[default]
    Unknown,
    Connected,
    Offline,
}

/// Latest known state of everything the LEDs report. `None` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub battery_capacity: Option<u8>,
    pub battery_charging: Option<bool>,
    pub network: NetworkState,
    pub is_5g: Option<bool>,
    pub wifi_running: Option<bool>,
}

/// Whether the access point is supposed to be up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiPolicy {
    pub enabled: bool,
    pub ap_requested: bool,
}

impl Default for WifiPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ap_requested: true,
        }
    }
}

pub type ModeSet<const N: usize> = [(LedChannel, LedMode); N];

pub fn network_modes(status: &DeviceStatus) -> ModeSet<6> {
    use LedChannel::*;
    use LedMode::*;

    if status.network == NetworkState::Unknown {
        return [
            (LteRed, SlowFlash),
            (LteGreen, Off),
            (LteBlue, Off),
            (NrRed, SlowFlash),
            (NrGreen, Off),
            (NrBlue, Off),
        ];
    }

    let connected = status.network == NetworkState::Connected;
    let (red, green) = if connected { (Off, On) } else { (SlowFlash, Off) };

    if status.is_5g.unwrap_or(false) {
        [
            (LteRed, Off),
            (LteGreen, Off),
            (LteBlue, Off),
            (NrRed, red),
            (NrGreen, green),
            (NrBlue, Off),
        ]
    } else {
        [
            (LteRed, red),
            (LteGreen, green),
            (LteBlue, Off),
            (NrRed, Off),
            (NrGreen, Off),
            (NrBlue, Off),
        ]
    }
}

/// Battery LEDs; both off while the capacity is unknown.
pub fn battery_modes(status: &DeviceStatus) -> ModeSet<2> {
    use LedChannel::{BatteryGreen, BatteryRed};
    use LedMode::*;

    let Some(capacity) = status.battery_capacity else {
        return [(BatteryRed, Off), (BatteryGreen, Off)];
    };
    let charging = status.battery_charging.unwrap_or(false);
    let low = capacity < LOW_BATTERY_PERCENT;

    let (red, green) = match (charging, low) {
        (true, true) => (SlowFlash, Off),
        (true, false) if capacity >= 100 => (Off, On),
        (true, false) => (Off, SlowFlash),
        (false, true) => (On, Off),
        (false, false) => (Off, On),
    };
    [(BatteryRed, red), (BatteryGreen, green)]
}

pub fn wifi_modes(status: &DeviceStatus, policy: WifiPolicy) -> ModeSet<2> {
    use LedChannel::{WifiGreen, WifiRed};
    use LedMode::*;

    if !policy.enabled || !policy.ap_requested {
        return [(WifiRed, Off), (WifiGreen, Off)];
    }
    let green = if status.wifi_running == Some(true) {
        On
    } else {
        SlowFlash
    };
    [(WifiRed, Off), (WifiGreen, green)]
}

/// Shutdown pattern: every red fast-flashing, everything else dark.
pub fn shutdown_modes() -> ModeSet<10> {
    LedChannel::ALL.map(|channel| {
        let mode = if LedChannel::REDS.contains(&channel) {
            LedMode::FastFlash
        } else {
            LedMode::Off
        };
        (channel, mode)
    })
}
