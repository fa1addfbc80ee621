//! Battery readings, charge thresholds and kernel battery events.

use std::{
    fs, io,
    os::fd::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;

/// Snapshot of `/sys/class/power_supply/battery/uevent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryInfo {
    pub status: String,
    pub health: String,
    pub capacity: Option<u8>,
    /// Degrees Celsius.
    pub temperature: Option<f32>,
    /// Volts.
    pub voltage: Option<f32>,
    /// Amperes.
    pub current: Option<f32>,
}

impl BatteryInfo {
    /// Parses `POWER_SUPPLY_*=value` lines; unknown keys are ignored.
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();

        for (key, value) in text.lines().filter_map(|line| line.split_once('=')) {
            let value = value.trim();
            match key.trim() {
                "POWER_SUPPLY_STATUS" => info.status = value.to_string(),
                "POWER_SUPPLY_HEALTH" => info.health = value.to_string(),
                "POWER_SUPPLY_CAPACITY" => {
                    info.capacity = value.parse::<i64>().ok().map(|c| c.clamp(0, 100) as u8);
                }
                "POWER_SUPPLY_TEMP" => {
                    info.temperature = value.parse::<f32>().ok().map(|t| t / 10.0);
                }
                "POWER_SUPPLY_VOLTAGE_NOW" => {
                    info.voltage = value.parse::<f32>().ok().map(|v| v / 1_000_000.0);
                }
                "POWER_SUPPLY_CURRENT_NOW" => {
                    info.current = value.parse::<f32>().ok().map(|c| c / 1_000_000.0);
                }
                _ => {}
            }
        }

        info
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read battery state from {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn is_charging(&self) -> bool {
        self.status == "Charging"
    }

    /// The part of the reading the status LEDs care about.
    pub fn key(&self) -> (Option<u8>, bool) {
        (self.capacity, self.is_charging())
    }
}

/// Automatic charge window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::start_threshold")]
    pub start_threshold: u8,
    #[serde(default = "defaults::stop_threshold")]
    pub stop_threshold: u8,
}

impl Default for ChargePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            start_threshold: defaults::start_threshold(),
            stop_threshold: defaults::stop_threshold(),
        }
    }
}

mod defaults {
    pub fn start_threshold() -> u8 {
        20
    }

    pub fn stop_threshold() -> u8 {
        80
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeAction {
    Start,
    Stop,
    Hold,
}

impl ChargePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.start_threshold > 100 || self.stop_threshold > 100 {
            bail!(
                "Charge thresholds must be within 0..=100 (start {}, stop {})",
                self.start_threshold,
                self.stop_threshold
            );
        }
        if self.start_threshold >= self.stop_threshold {
            bail!(
                "Charge start threshold {} must be below stop threshold {}",
                self.start_threshold,
                self.stop_threshold
            );
        }
        Ok(())
    }

    pub fn decide(&self, info: &BatteryInfo) -> ChargeAction {
        let Some(capacity) = info.capacity.filter(|_| self.enabled) else {
            return ChargeAction::Hold;
        };
        let charging = info.is_charging();

        if charging && capacity >= self.stop_threshold {
            ChargeAction::Stop
        } else if !charging && capacity <= self.start_threshold {
            ChargeAction::Start
        } else {
            ChargeAction::Hold
        }
    }
}

/// The charger's `stop_charge` switch.
#[derive(Debug, Clone)]
pub struct ChargeSwitch {
    path: PathBuf,
}

impl ChargeSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn set_charging(&self, enable: bool) -> Result<()> {
        let value = if enable { "0" } else { "1" };
        fs::write(&self.path, value)
            .with_context(|| format!("Failed to write {value} to {}", self.path.display()))
    }
}

/// True for a uevent datagram that concerns the battery power supply.
pub fn is_battery_event(datagram: &[u8]) -> bool {
    let mut power_supply = false;
    let mut battery = false;

    for field in datagram.split(|b| *b == 0) {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        match field.split_once('=') {
            Some(("SUBSYSTEM", "power_supply")) => power_supply = true,
            Some(("POWER_SUPPLY_NAME", "battery")) => battery = true,
            Some(("DEVPATH", path)) if path.contains("/battery") => battery = true,
            _ => {}
        }
    }

    power_supply && battery
}

/// Non-blocking `NETLINK_KOBJECT_UEVENT` socket bound to the kernel multicast group.
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .context("Failed to create uevent socket")?;

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 1)).context("Failed to bind uevent socket")?;

        let fd = AsyncFd::try_new(fd)
            .map_err(io::Error::from)
            .context("Failed to register uevent socket")?;
        Ok(Self { fd })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv(inner.as_raw_fd(), buf, MsgFlags::empty()).map_err(io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

pub type BatteryCallback = Box<dyn Fn(&BatteryInfo) + Send + Sync>;

struct Subscriber {
    callback: BatteryCallback,
    last: (Option<u8>, bool),
}

/// Reads the battery, enforces the charge window and notifies subscribers.
///
/// A subscriber is called once when registered and afterwards only when a
/// new reading changes its `(capacity, charging)` pair.
pub struct ChargeMonitor {
    uevent_path: PathBuf,
    switch: ChargeSwitch,
    policy: RwLock<ChargePolicy>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChargeMonitor {
    pub fn new(uevent_path: impl Into<PathBuf>, switch: ChargeSwitch, policy: ChargePolicy) -> Self {
        Self {
            uevent_path: uevent_path.into(),
            switch,
            policy: RwLock::new(policy),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current reading; an unreadable battery yields an empty reading.
    pub fn get_battery_status(&self) -> BatteryInfo {
        BatteryInfo::read(&self.uevent_path).unwrap_or_else(|e| {
            warn!("{e:#}");
            BatteryInfo::default()
        })
    }

    pub fn register_callback(&self, callback: BatteryCallback) {
        let info = self.get_battery_status();
        callback(&info);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                callback,
                last: info.key(),
            });
    }

    /// Processes one battery event: re-reads, applies the policy and notifies.
    pub fn handle_event(&self) -> BatteryInfo {
        let info = self.get_battery_status();
        debug!("Battery event: {info:?}");
        self.apply_policy(&info);

        let key = info.key();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter_mut().filter(|s| s.last != key) {
            subscriber.last = key;
            (subscriber.callback)(&info);
        }
        info
    }

    pub fn apply_policy(&self, info: &BatteryInfo) -> ChargeAction {
        let action = self.policy().decide(info);
        let result = match action {
            ChargeAction::Stop => self.switch.set_charging(false),
            ChargeAction::Start => self.switch.set_charging(true),
            ChargeAction::Hold => return action,
        };

        match result {
            Ok(()) => info!(
                "Charge {:?} at {}%",
                action,
                info.capacity.unwrap_or_default()
            ),
            Err(e) => warn!("Charge {action:?} failed: {e:#}"),
        }
        action
    }

    pub fn policy(&self) -> ChargePolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: ChargePolicy) -> Result<()> {
        policy.validate()?;
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        info!("Charge policy updated: {policy:?}");
        Ok(())
    }

    /// Manual charger switch, independent of the policy.
    pub fn set_charging(&self, enable: bool) -> Result<()> {
        self.switch.set_charging(enable)
    }
}
