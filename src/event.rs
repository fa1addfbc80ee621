//! Broadcast events shared between services.

use anyhow::Result;
use tokio::sync::broadcast;

use crate::{power_key::Gesture, status::DeviceStatus};

/// How a configuration file change has to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeType {
    /// Charge policy and WiFi flags; applied in place.
    HotReload,
    /// Anything touching device paths, timings or the bus; needs a restart.
    ColdRestart {
        /// Top-level sections that differ.
        changed_sections: Vec<String>,
    },
}

/// Daemon-wide notifications.
///
/// Observers subscribe through [`EventBus`]; the LED loop never waits on them.
#[derive(Debug, Clone)]
pub enum Event {
    ConfigChangeDetected(ConfigChangeType),
    /// The aggregated device status changed.
    StatusChanged(DeviceStatus),
    GestureDetected(Gesture),
    /// A long press started the shutdown countdown.
    ShutdownRequested,
}

/// Publish-subscribe channel between services.
///
/// ```no_run
/// use gatewayd::event::{Event, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(Event::ShutdownRequested).ok();
/// // rx.recv().await in async context
/// # drop(rx);
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes to every subscriber.
    ///
    /// Returns an error if nobody is subscribed.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
