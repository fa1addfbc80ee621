//! Service providers started by the coordinator.

pub mod app_state;
pub mod battery;
pub mod config_watcher;
pub mod dbus;
pub mod leds;
pub mod network;
pub mod power_key;
pub mod traits;
pub mod wifi;

pub use app_state::AppStateProvider;
pub use battery::BatteryServiceProvider;
pub use config_watcher::ConfigWatcherServiceProvider;
pub use dbus::DBusServiceProvider;
pub use leds::LedServiceProvider;
pub use network::NetworkServiceProvider;
pub use power_key::PowerKeyServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
pub use wifi::WifiServiceProvider;
