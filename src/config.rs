//! Configuration management for the gatewayd daemon.
//!
//! Loads, validates and hot-reloads the YAML file that describes device
//! paths, timings and the charge/WiFi policies.

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::{battery::ChargePolicy, event::ConfigChangeType, status::WifiPolicy};

pub const CONFIG_ENV: &str = "GATEWAYD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gatewayd/config.yml";

/// Top-level configuration.
///
/// Every section is optional; a missing section takes its defaults.
///
/// # Example
///
/// ```yaml
/// version: 1
/// leds:
///   render_interval_ms: 500
/// battery:
///   charge:
///     enabled: true
///     start_threshold: 20
///     stop_threshold: 80
/// wifi:
///   ap_requested: true
/// power_key:
///   shutdown_command: ["poweroff"]
/// dbus:
///   bus: system
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    #[serde(default)]
    pub leds: LedConfig,

    #[serde(default)]
    pub battery: BatteryConfig,

    #[serde(default)]
    pub modem: ModemConfig,

    #[serde(default)]
    pub wifi: WifiConfig,

    #[serde(default)]
    pub power_key: PowerKeyConfig,

    #[serde(default)]
    pub dbus: DbusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedConfig {
    /// LED class directory holding one subdirectory per channel.
    #[serde(default = "defaults::led_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "defaults::render_interval_ms")]
    pub render_interval_ms: u64,

    /// Every n-th render tick rewrites all channels.
    #[serde(default = "defaults::force_rewrite_every")]
    pub force_rewrite_every: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "defaults::battery_uevent")]
    pub uevent_path: PathBuf,

    #[serde(default = "defaults::stop_charge")]
    pub stop_charge_path: PathBuf,

    /// Hot-reloadable.
    #[serde(default)]
    pub charge: ChargePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Bus name of the telephony service.
    #[serde(default = "defaults::modem_service")]
    pub service: String,

    /// Modem object used when the data card cannot be resolved.
    #[serde(default = "defaults::modem_endpoint")]
    pub default_endpoint: String,

    #[serde(default = "defaults::at_timeout_ms")]
    pub at_timeout_ms: u64,

    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Hot-reloadable.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Hot-reloadable.
    #[serde(default = "defaults::enabled")]
    pub ap_requested: bool,

    #[serde(default = "defaults::pid_files")]
    pub pid_files: Vec<PathBuf>,

    #[serde(default = "defaults::proc_root")]
    pub proc_root: PathBuf,

    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerKeyConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Input devices tried in order; the first that opens is used.
    #[serde(default = "defaults::input_devices")]
    pub devices: Vec<PathBuf>,

    #[serde(default = "defaults::key_code")]
    pub key_code: u16,

    #[serde(default = "defaults::long_press_ms")]
    pub long_press_ms: u64,

    #[serde(default = "defaults::double_click_ms")]
    pub double_click_ms: u64,

    #[serde(default = "defaults::shutdown_delay_ms")]
    pub shutdown_delay_ms: u64,

    #[serde(default = "defaults::shutdown_command")]
    pub shutdown_command: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbusConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            leds: LedConfig::default(),
            battery: BatteryConfig::default(),
            modem: ModemConfig::default(),
            wifi: WifiConfig::default(),
            power_key: PowerKeyConfig::default(),
            dbus: DbusConfig::default(),
        }
    }
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            sysfs_root: defaults::led_root(),
            render_interval_ms: defaults::render_interval_ms(),
            force_rewrite_every: defaults::force_rewrite_every(),
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            uevent_path: defaults::battery_uevent(),
            stop_charge_path: defaults::stop_charge(),
            charge: ChargePolicy::default(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            service: defaults::modem_service(),
            default_endpoint: defaults::modem_endpoint(),
            at_timeout_ms: defaults::at_timeout_ms(),
            poll_interval_secs: defaults::poll_interval_secs(),
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ap_requested: true,
            pid_files: defaults::pid_files(),
            proc_root: defaults::proc_root(),
            poll_interval_secs: defaults::poll_interval_secs(),
        }
    }
}

impl Default for PowerKeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            devices: defaults::input_devices(),
            key_code: defaults::key_code(),
            long_press_ms: defaults::long_press_ms(),
            double_click_ms: defaults::double_click_ms(),
            shutdown_delay_ms: defaults::shutdown_delay_ms(),
            shutdown_command: defaults::shutdown_command(),
        }
    }
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bus: BusKind::System,
        }
    }
}

impl WifiConfig {
    pub fn policy(&self) -> WifiPolicy {
        WifiPolicy {
            enabled: self.enabled,
            ap_requested: self.ap_requested,
        }
    }
}

impl LedConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }
}

impl Config {
    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.battery
            .charge
            .validate()
            .context("Invalid battery.charge section")?;

        let intervals = [
            ("leds.render_interval_ms", self.leds.render_interval_ms),
            ("leds.force_rewrite_every", self.leds.force_rewrite_every),
            ("modem.at_timeout_ms", self.modem.at_timeout_ms),
            ("modem.poll_interval_secs", self.modem.poll_interval_secs),
            ("wifi.poll_interval_secs", self.wifi.poll_interval_secs),
            ("power_key.long_press_ms", self.power_key.long_press_ms),
            ("power_key.double_click_ms", self.power_key.double_click_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than zero");
        }

        if self.power_key.shutdown_command.is_empty() {
            bail!("power_key.shutdown_command must not be empty");
        }
        if self.power_key.enabled && self.power_key.devices.is_empty() {
            bail!("power_key.devices must list at least one device when enabled");
        }
        if !self.modem.default_endpoint.starts_with('/') {
            bail!(
                "modem.default_endpoint '{}' is not an object path",
                self.modem.default_endpoint
            );
        }

        Ok(())
    }

    /// Names of top-level sections whose change needs a restart.
    fn cold_sections_changed(&self, other: &Config) -> Vec<String> {
        let mut changed = Vec::new();

        if self.leds != other.leds {
            changed.push("leds".to_string());
        }
        if self.battery.uevent_path != other.battery.uevent_path
            || self.battery.stop_charge_path != other.battery.stop_charge_path
        {
            changed.push("battery".to_string());
        }
        if self.modem != other.modem {
            changed.push("modem".to_string());
        }
        if self.wifi.pid_files != other.wifi.pid_files
            || self.wifi.proc_root != other.wifi.proc_root
            || self.wifi.poll_interval_secs != other.wifi.poll_interval_secs
        {
            changed.push("wifi".to_string());
        }
        if self.power_key != other.power_key {
            changed.push("power_key".to_string());
        }
        if self.dbus != other.dbus {
            changed.push("dbus".to_string());
        }

        changed
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn enabled() -> bool {
        true
    }

    pub fn led_root() -> PathBuf {
        PathBuf::from("/sys/class/leds")
    }

    pub fn render_interval_ms() -> u64 {
        500
    }

    pub fn force_rewrite_every() -> u64 {
        6
    }

    pub fn battery_uevent() -> PathBuf {
        PathBuf::from("/sys/class/power_supply/battery/uevent")
    }

    pub fn stop_charge() -> PathBuf {
        PathBuf::from("/sys/class/power_supply/battery/charger.0/stop_charge")
    }

    pub fn modem_service() -> String {
        "org.ofono".to_string()
    }

    pub fn modem_endpoint() -> String {
        "/ril_0".to_string()
    }

    pub fn at_timeout_ms() -> u64 {
        8000
    }

    pub fn poll_interval_secs() -> u64 {
        2
    }

    pub fn pid_files() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/mnt/data/hw5pid"),
            PathBuf::from("/mnt/data/hw2pid"),
        ]
    }

    pub fn proc_root() -> PathBuf {
        PathBuf::from("/proc")
    }

    pub fn input_devices() -> Vec<PathBuf> {
        (0..4)
            .map(|n| PathBuf::from(format!("/dev/input/event{n}")))
            .collect()
    }

    pub fn key_code() -> u16 {
        116
    }

    pub fn long_press_ms() -> u64 {
        2000
    }

    pub fn double_click_ms() -> u64 {
        500
    }

    pub fn shutdown_delay_ms() -> u64 {
        4000
    }

    pub fn shutdown_command() -> Vec<String> {
        vec!["poweroff".to_string()]
    }
}

/// Config file to read when none was given on the command line, if any.
fn locate_config() -> Option<PathBuf> {
    if let Some(env_path) = env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    let etc = Path::new(DEFAULT_CONFIG_PATH);
    etc.exists().then(|| etc.to_path_buf())
}

/// Shared configuration plus the file it came from.
///
/// ```no_run
/// use gatewayd::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let interval = config_manager.get().await.modem.poll_interval_secs;
/// let change = config_manager.analyze_config_changes().await?;
/// # let _ = (interval, change);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration.
    ///
    /// Lookup order: `path`, then `$GATEWAYD_CONFIG`, then
    /// `/etc/gatewayd/config.yml`. With none of them present the built-in
    /// defaults are used.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = path.or_else(locate_config) else {
            warn!("No configuration file found, using built-in defaults");
            return Ok(Self::new(Config::default(), PathBuf::from(DEFAULT_CONFIG_PATH)));
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path).await?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub async fn get_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Config> {
        self.config.write().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file and classifies the difference.
    ///
    /// Hot-reloadable changes are applied in memory. When any other section
    /// changed nothing is applied and the changed sections are reported.
    pub async fn analyze_config_changes(&self) -> Result<ConfigChangeType> {
        let new_config = Self::load_config_from_path(&self.path).await?;
        let mut current = self.config.write().await;

        let changed_sections = current.cold_sections_changed(&new_config);
        if !changed_sections.is_empty() {
            return Ok(ConfigChangeType::ColdRestart { changed_sections });
        }

        *current = new_config;
        Ok(ConfigChangeType::HotReload)
    }

    /// Writes the in-memory configuration back to its file through a
    /// temporary file renamed into place.
    pub async fn save(&self) -> Result<()> {
        let config = self.config.read().await;
        Self::save_to_path(&config, &self.path)
    }

    fn save_to_path(config: &Config, path: &Path) -> Result<()> {
        let config_yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration")?;

        let tmp_path = path.with_extension("yml.tmp");
        fs::write(&tmp_path, config_yaml).with_context(|| {
            format!("Failed to write temporary config to {}", tmp_path.display())
        })?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move config to {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    pub async fn validate(&self) -> Result<()> {
        self.config.read().await.validate()
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    async fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
