//! # gatewayd
//!
//! Device status coordinator for a battery-powered cellular/WiFi gateway.
//!
//! The daemon watches the battery, the cellular modem, the WiFi access point
//! and the power key, and reflects their state on ten status LEDs. It also
//! enforces a charge window on the battery and serves modem commands to
//! external handlers over D-Bus.
//!
//! ## Architecture
//!
//! - [`CommandBus`](modem::CommandBus) serializes every modem command and
//!   applies the retry policy.
//! - Status producers (battery, network, WiFi, power key) send updates to the
//!   [`StatusAggregator`](aggregator::StatusAggregator), the single owner of
//!   the LEDs, which repaints on a 500 ms render tick.
//! - [`DeviceCoordinator`](coordinator::DeviceCoordinator) starts every
//!   service through a [`TaskManager`](task_manager::TaskManager) and relays
//!   [`EventBus`](event::EventBus) events.
//!
//! ## Example
//!
//! ```no_run
//! use gatewayd::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod aggregator;
pub mod app_context;
pub mod application;
pub mod battery;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod interface;
pub mod led;
pub mod modem;
pub mod network;
pub mod power_key;
pub mod providers;
pub mod shell;
pub mod status;
pub mod task_manager;
pub mod wifi;
