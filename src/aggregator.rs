//! Status aggregation and LED rendering.
//!
//! [`StatusAggregator::run`] is the only task that mutates the LED table. It
//! multiplexes the render tick, producer events, control commands, power key
//! transitions and the gesture/shutdown timers on one loop. Everything else
//! talks to it through a [`LedController`] or the status sender.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, watch},
    time::{Instant, MissedTickBehavior, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    battery::{BatteryInfo, ChargeMonitor},
    event::{Event, EventBus},
    led::{LedChannel, LedMode, LedSink, LedState, LedTable},
    network::NetworkSample,
    power_key::{Gesture, GestureClassifier, GestureTiming, KeyAction, KeyEvent, KeyTransition, PowerKeyMonitor},
    shell::CommandRunner,
    status::{self, DeviceStatus, WifiPolicy},
    wifi::WifiProbe,
};

pub const RENDER_INTERVAL: Duration = Duration::from_millis(500);
pub const FORCE_REWRITE_EVERY: u64 = 6;
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(4000);

/// Input to the aggregator loop.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Battery(BatteryInfo),
    Network(NetworkSample),
    Wifi(bool),
    Control(LedCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    SetMode(LedChannel, LedMode),
    SetBrightness(LedChannel, u8),
    AllOff,
    Refresh,
    SetWifiPolicy(WifiPolicy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleGroup {
    Network,
    Battery,
    Wifi,
}

struct RenderState {
    table: LedTable,
    status: DeviceStatus,
    wifi_policy: WifiPolicy,
    shutting_down: bool,
}

/// Point-in-time view of the LEDs and the status behind them.
#[derive(Debug, Clone, Serialize)]
pub struct LedSnapshot {
    pub leds: Vec<LedState>,
    pub status: DeviceStatus,
    pub wifi_policy: WifiPolicy,
    pub led_enabled: bool,
    pub shutting_down: bool,
}

/// Handle for external callers. Commands are queued onto the loop in order.
#[derive(Clone)]
pub struct LedController {
    tx: mpsc::UnboundedSender<StatusEvent>,
    state: Arc<Mutex<RenderState>>,
    power_key: PowerKeyMonitor,
}

impl LedController {
    pub fn set_mode(&self, channel: LedChannel, mode: LedMode) -> Result<()> {
        self.send(LedCommand::SetMode(channel, mode))
    }

    pub fn set_brightness(&self, channel: LedChannel, brightness: u8) -> Result<()> {
        self.send(LedCommand::SetBrightness(channel, brightness))
    }

    pub fn all_off(&self) -> Result<()> {
        self.send(LedCommand::AllOff)
    }

    pub fn refresh(&self) -> Result<()> {
        self.send(LedCommand::Refresh)
    }

    pub fn set_wifi_policy(&self, policy: WifiPolicy) -> Result<()> {
        self.send(LedCommand::SetWifiPolicy(policy))
    }

    pub async fn wifi_policy(&self) -> WifiPolicy {
        self.state.lock().await.wifi_policy
    }

    pub async fn snapshot(&self) -> LedSnapshot {
        let state = self.state.lock().await;
        LedSnapshot {
            leds: state.table.snapshot(),
            status: state.status,
            wifi_policy: state.wifi_policy,
            led_enabled: self.power_key.is_led_enabled(),
            shutting_down: state.shutting_down,
        }
    }

    fn send(&self, command: LedCommand) -> Result<()> {
        self.tx
            .send(StatusEvent::Control(command))
            .map_err(|_| anyhow!("LED loop is not running"))
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub render_interval: Duration,
    pub force_every: u64,
    pub gesture: GestureTiming,
    pub shutdown_delay: Duration,
    pub shutdown_command: Vec<String>,
    pub wifi_policy: WifiPolicy,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            render_interval: RENDER_INTERVAL,
            force_every: FORCE_REWRITE_EVERY,
            gesture: GestureTiming::default(),
            shutdown_delay: SHUTDOWN_DELAY,
            shutdown_command: vec!["poweroff".to_string()],
            wifi_policy: WifiPolicy::default(),
        }
    }
}

/// Collaborators the loop reads from or drives.
pub struct AggregatorDeps {
    pub sink: Box<dyn LedSink>,
    pub charge_monitor: Arc<ChargeMonitor>,
    pub wifi_probe: Arc<WifiProbe>,
    pub power_key: PowerKeyMonitor,
    pub runner: Arc<dyn CommandRunner>,
    pub event_bus: EventBus,
}

pub struct StatusAggregator {
    state: Arc<Mutex<RenderState>>,
    events_tx: mpsc::UnboundedSender<StatusEvent>,
    events_rx: mpsc::UnboundedReceiver<StatusEvent>,
    keys_tx: mpsc::UnboundedSender<KeyEvent>,
    keys_rx: mpsc::UnboundedReceiver<KeyEvent>,
    refresh: watch::Sender<u64>,
    charge_monitor: Arc<ChargeMonitor>,
    wifi_probe: Arc<WifiProbe>,
    power_key: PowerKeyMonitor,
    runner: Arc<dyn CommandRunner>,
    event_bus: EventBus,
    settings: AggregatorSettings,
    classifier: GestureClassifier,
    long_press_at: Option<Instant>,
    shutdown_at: Option<Instant>,
}

impl StatusAggregator {
    pub fn new(deps: AggregatorDeps, settings: AggregatorSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        let (refresh, _) = watch::channel(0);

        let state = RenderState {
            table: LedTable::new(deps.sink, settings.force_every),
            status: DeviceStatus::default(),
            wifi_policy: settings.wifi_policy,
            shutting_down: false,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            events_tx,
            events_rx,
            keys_tx,
            keys_rx,
            refresh,
            charge_monitor: deps.charge_monitor,
            wifi_probe: deps.wifi_probe,
            power_key: deps.power_key,
            runner: deps.runner,
            event_bus: deps.event_bus,
            classifier: GestureClassifier::new(settings.gesture),
            settings,
            long_press_at: None,
            shutdown_at: None,
        }
    }

    pub fn controller(&self) -> LedController {
        LedController {
            tx: self.events_tx.clone(),
            state: self.state.clone(),
            power_key: self.power_key.clone(),
        }
    }

    /// Sender for producer events.
    pub fn status_sender(&self) -> mpsc::UnboundedSender<StatusEvent> {
        self.events_tx.clone()
    }

    /// Sender for raw power key transitions.
    pub fn key_sender(&self) -> mpsc::UnboundedSender<KeyEvent> {
        self.keys_tx.clone()
    }

    /// Changes whenever a refresh resets the producers' latched values.
    pub fn refresh_receiver(&self) -> watch::Receiver<u64> {
        self.refresh.subscribe()
    }

    /// Tells the pollers to forget their latched values.
    pub(crate) fn signal_refresh(&self) {
        self.refresh
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    #[cfg(test)]
    pub(crate) async fn next_status_event(&mut self) -> StatusEvent {
        self.events_rx.recv().await.expect("sender is held by the aggregator")
    }

    pub async fn run(mut self, cancel_token: CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.table.init();
            self.paint_all(&mut state);
        }

        let mut ticker = tokio::time::interval(self.settings.render_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Queued key transitions win over the timers: a release read
            // before the long-press deadline must cancel it.
            tokio::select! {
                biased;

                () = cancel_token.cancelled() => {
                    info!("LED loop stopped");
                    break;
                }
                Some(key) = self.keys_rx.recv() => self.handle_key(key).await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = ticker.tick() => {
                    let writes = self.state.lock().await.table.render_tick();
                    if writes > 0 {
                        debug!("Render tick wrote {writes} LEDs");
                    }
                }
                () = sleep_until_opt(self.long_press_at) => {
                    self.long_press_at = None;
                    let gesture = self.classifier.on_long_press();
                    self.begin_shutdown(gesture).await;
                }
                () = sleep_until_opt(self.shutdown_at) => {
                    self.shutdown_at = None;
                    self.issue_shutdown();
                }
            }
        }

        self.state.lock().await.table.all_off();
        Ok(())
    }

    async fn handle_event(&mut self, event: StatusEvent) {
        let mut state = self.state.lock().await;
        let before = state.status;

        let group = match event {
            StatusEvent::Battery(info) => {
                state.status.battery_capacity = info.capacity;
                state.status.battery_charging = Some(info.is_charging());
                RuleGroup::Battery
            }
            StatusEvent::Network(sample) => {
                state.status.network = sample.state;
                state.status.is_5g = sample.is_5g;
                RuleGroup::Network
            }
            StatusEvent::Wifi(alive) => {
                state.status.wifi_running = Some(alive);
                RuleGroup::Wifi
            }
            StatusEvent::Control(command) => {
                self.handle_command(&mut state, command);
                return;
            }
        };

        self.paint(&mut state, group);
        if state.status != before {
            self.publish(Event::StatusChanged(state.status));
        }
    }

    fn handle_command(&self, state: &mut RenderState, command: LedCommand) {
        match command {
            LedCommand::SetMode(..) | LedCommand::AllOff if state.shutting_down => {
                debug!("Ignoring {command:?} during shutdown");
            }
            LedCommand::SetMode(channel, mode) => {
                state.table.set_mode(channel, mode);
            }
            LedCommand::SetBrightness(channel, brightness) => {
                state.table.set_brightness(channel, brightness)
            }
            LedCommand::AllOff => state.table.all_off(),
            LedCommand::Refresh => self.refresh(state),
            LedCommand::SetWifiPolicy(policy) => {
                state.wifi_policy = policy;
                self.paint(state, RuleGroup::Wifi);
            }
        }
    }

    /// Drops every latched value, re-reads what can be read synchronously
    /// and repaints. Network stays unknown until the next poll.
    fn refresh(&self, state: &mut RenderState) {
        info!("Refreshing LED status");
        self.signal_refresh();

        let battery = self.charge_monitor.get_battery_status();
        state.status = DeviceStatus {
            battery_capacity: battery.capacity,
            battery_charging: Some(battery.is_charging()),
            wifi_running: Some(self.wifi_probe.is_alive()),
            ..DeviceStatus::default()
        };
        self.paint_all(state);
        self.publish(Event::StatusChanged(state.status));
    }

    async fn handle_key(&mut self, key: KeyEvent) {
        if self.shutdown_at.is_some() {
            return;
        }

        let action = match key.transition {
            KeyTransition::Down => self.classifier.on_down(key.at),
            KeyTransition::Up => self.classifier.on_up(key.at),
        };

        match action {
            KeyAction::ArmLongPress(deadline) => self.long_press_at = Some(deadline),
            KeyAction::CancelLongPress => self.long_press_at = None,
            KeyAction::Emit(gesture) => {
                self.long_press_at = None;
                self.on_double_click(gesture).await;
            }
        }
    }

    async fn on_double_click(&mut self, gesture: Gesture) {
        let enabled = self.power_key.toggle_led_enabled();
        info!("Double click: LEDs {}", if enabled { "enabled" } else { "disabled" });

        let mut state = self.state.lock().await;
        if enabled {
            self.refresh(&mut state);
        } else {
            state.table.all_off();
        }
        drop(state);

        self.publish(Event::GestureDetected(gesture));
    }

    async fn begin_shutdown(&mut self, gesture: Gesture) {
        warn!(
            "Long press: shutting down in {:?}",
            self.settings.shutdown_delay
        );

        let mut state = self.state.lock().await;
        state.shutting_down = true;
        state.table.apply(&status::shutdown_modes());
        drop(state);

        self.shutdown_at = Some(Instant::now() + self.settings.shutdown_delay);
        self.publish(Event::GestureDetected(gesture));
        self.publish(Event::ShutdownRequested);
    }

    fn issue_shutdown(&self) {
        let runner = self.runner.clone();
        let command = self.settings.shutdown_command.clone();
        info!("Issuing shutdown command {command:?}");

        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || runner.run_line(&command)).await {
                Ok(Ok(output)) if output.success() => info!("Shutdown command accepted"),
                Ok(Ok(output)) => error!("Shutdown command exited with {}", output.status),
                Ok(Err(e)) => error!("Shutdown command failed: {e:#}"),
                Err(e) => error!("Shutdown task panicked: {e}"),
            }
        });
    }

    fn paint_all(&self, state: &mut RenderState) {
        for group in [RuleGroup::Network, RuleGroup::Battery, RuleGroup::Wifi] {
            self.paint(state, group);
        }
    }

    /// Recomputes one rule group. Suppressed while LEDs are disabled or the
    /// shutdown pattern is showing.
    fn paint(&self, state: &mut RenderState, group: RuleGroup) {
        if state.shutting_down || !self.power_key.is_led_enabled() {
            return;
        }
        let status = state.status;
        match group {
            RuleGroup::Network => state.table.apply(&status::network_modes(&status)),
            RuleGroup::Battery => state.table.apply(&status::battery_modes(&status)),
            RuleGroup::Wifi => state
                .table
                .apply(&status::wifi_modes(&status, state.wifi_policy)),
        }
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event) {
            debug!("No event subscribers: {e}");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        battery::{ChargePolicy, ChargeSwitch},
        led::{LedChannel::*, LedMode::*, testing::RecordingSink},
        shell::testing::FakeRunner,
        status::NetworkState,
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::time::sleep;

    struct Harness {
        controller: LedController,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
        key_tx: mpsc::UnboundedSender<KeyEvent>,
        refresh_rx: watch::Receiver<u64>,
        sink: RecordingSink,
        runner: FakeRunner,
        power_key: PowerKeyMonitor,
        events: tokio::sync::broadcast::Receiver<Event>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    fn battery(capacity: u8, status: &str) -> BatteryInfo {
        BatteryInfo::parse(&format!(
            "POWER_SUPPLY_STATUS={status}\nPOWER_SUPPLY_CAPACITY={capacity}\n"
        ))
    }

    fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let uevent = dir.path().join("uevent");
        std::fs::write(&uevent, "POWER_SUPPLY_STATUS=Charging\nPOWER_SUPPLY_CAPACITY=80\n").unwrap();
        let monitor = ChargeMonitor::new(
            &uevent,
            ChargeSwitch::new(dir.path().join("stop_charge")),
            ChargePolicy::default(),
        );
        let probe = WifiProbe::new(vec![dir.path().join("hw5pid")], dir.path().join("proc"));

        let sink = RecordingSink::default();
        let runner = FakeRunner::default();
        let power_key = PowerKeyMonitor::new();
        let event_bus = EventBus::new();
        let events = event_bus.subscribe();

        let aggregator = StatusAggregator::new(
            AggregatorDeps {
                sink: Box::new(sink.clone()),
                charge_monitor: Arc::new(monitor),
                wifi_probe: Arc::new(probe),
                power_key: power_key.clone(),
                runner: Arc::new(runner.clone()),
                event_bus,
            },
            AggregatorSettings::default(),
        );

        let harness = Harness {
            controller: aggregator.controller(),
            status_tx: aggregator.status_sender(),
            key_tx: aggregator.key_sender(),
            refresh_rx: aggregator.refresh_receiver(),
            sink,
            runner,
            power_key,
            events,
            cancel: CancellationToken::new(),
            _dir: dir,
        };
        tokio::spawn(aggregator.run(harness.cancel.clone()));
        harness
    }

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    async fn mode(h: &Harness, channel: LedChannel) -> LedMode {
        h.controller.snapshot().await.leds[channel.index()].mode
    }

    fn key(transition: KeyTransition) -> KeyEvent {
        KeyEvent {
            transition,
            at: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_shows_unknown_network_and_flashing_wifi() {
        let h = start();
        settle().await;

        assert_eq!(h.sink.claimed.lock().unwrap().len(), 10);
        assert_eq!(mode(&h, LteRed).await, SlowFlash);
        assert_eq!(mode(&h, NrRed).await, SlowFlash);
        assert_eq!(mode(&h, LteGreen).await, Off);
        assert_eq!(mode(&h, BatteryRed).await, Off);
        assert_eq!(mode(&h, BatteryGreen).await, Off);
        assert_eq!(mode(&h, WifiGreen).await, SlowFlash);
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_not_charging_lights_red() {
        let h = start();
        h.status_tx
            .send(StatusEvent::Battery(battery(25, "Discharging")))
            .unwrap();
        settle().await;

        assert_eq!(mode(&h, BatteryRed).await, On);
        assert_eq!(mode(&h, BatteryGreen).await, Off);
        assert_eq!(h.sink.last(BatteryRed), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn half_battery_charging_flashes_green() {
        let h = start();
        h.status_tx
            .send(StatusEvent::Battery(battery(50, "Charging")))
            .unwrap();
        settle().await;

        assert_eq!(mode(&h, BatteryGreen).await, SlowFlash);
        assert_eq!(mode(&h, BatteryRed).await, Off);
    }

    #[tokio::test(start_paused = true)]
    async fn network_updates_switch_groups() {
        let mut h = start();
        settle().await;

        h.status_tx
            .send(StatusEvent::Network(NetworkSample {
                state: NetworkState::Connected,
                is_5g: Some(true),
            }))
            .unwrap();
        settle().await;

        assert_eq!(mode(&h, NrGreen).await, On);
        assert_eq!(mode(&h, LteRed).await, Off);
        assert_eq!(mode(&h, NrRed).await, Off);

        h.status_tx
            .send(StatusEvent::Network(NetworkSample::UNKNOWN))
            .unwrap();
        settle().await;

        assert_eq!(mode(&h, LteRed).await, SlowFlash);
        assert_eq!(mode(&h, NrRed).await, SlowFlash);
        assert_eq!(mode(&h, NrGreen).await, Off);

        let mut changes = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, Event::StatusChanged(_)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_status_causes_no_writes_between_forced_ticks() {
        let h = start();
        let connected = NetworkSample {
            state: NetworkState::Connected,
            is_5g: Some(false),
        };
        h.status_tx.send(StatusEvent::Network(connected)).unwrap();
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        h.status_tx
            .send(StatusEvent::Battery(battery(90, "Discharging")))
            .unwrap();
        settle().await;

        // tick 0 was forced; ticks 1..5 see steady LEDs only
        let before = h.sink.count();
        h.status_tx.send(StatusEvent::Network(connected)).unwrap();
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.sink.count(), before);

        // tick 6 rewrites all ten
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(h.sink.count(), before + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_lasts_until_next_recompute() {
        let h = start();
        settle().await;

        h.controller.set_mode(WifiRed, FastFlash).unwrap();
        h.controller.set_mode(BatteryGreen, On).unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiRed).await, FastFlash);

        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiRed).await, Off);
        assert_eq!(mode(&h, WifiGreen).await, On);
        assert_eq!(mode(&h, BatteryGreen).await, On);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rereads_battery_and_resets_network() {
        let mut h = start();
        h.status_tx
            .send(StatusEvent::Network(NetworkSample {
                state: NetworkState::Connected,
                is_5g: Some(false),
            }))
            .unwrap();
        settle().await;
        assert_eq!(mode(&h, LteGreen).await, On);

        h.controller.refresh().unwrap();
        settle().await;

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.status.network, NetworkState::Unknown);
        assert_eq!(snapshot.status.battery_capacity, Some(80));
        assert_eq!(snapshot.status.wifi_running, Some(false));
        assert_eq!(mode(&h, LteRed).await, SlowFlash);
        assert_eq!(mode(&h, BatteryGreen).await, SlowFlash);
        assert!(h.refresh_rx.has_changed().unwrap());
        h.refresh_rx.mark_unchanged();
    }

    #[tokio::test(start_paused = true)]
    async fn wifi_policy_turns_leds_off() {
        let h = start();
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiGreen).await, On);

        h.controller
            .set_wifi_policy(WifiPolicy {
                enabled: true,
                ap_requested: false,
            })
            .unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiGreen).await, Off);
        assert!(!h.controller.wifi_policy().await.ap_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_flashes_reds_then_powers_off() {
        let h = start();
        settle().await;

        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        sleep(Duration::from_millis(1990)).await;
        assert!(!h.controller.snapshot().await.shutting_down);

        sleep(Duration::from_millis(20)).await;
        let snapshot = h.controller.snapshot().await;
        assert!(snapshot.shutting_down);
        for channel in LedChannel::ALL {
            let expected = if LedChannel::REDS.contains(&channel) {
                FastFlash
            } else {
                Off
            };
            assert_eq!(snapshot.leds[channel.index()].mode, expected, "{channel:?}");
        }

        // status updates no longer repaint
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiGreen).await, Off);

        // nor do manual overrides
        h.controller.set_mode(LteRed, Off).unwrap();
        h.controller.all_off().unwrap();
        settle().await;
        assert_eq!(mode(&h, LteRed).await, FastFlash);

        sleep(Duration::from_millis(3900)).await;
        assert!(h.runner.calls().is_empty());

        sleep(Duration::from_millis(200)).await;
        for _ in 0..200 {
            if !h.runner.calls().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(h.runner.calls(), vec![vec!["poweroff".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn key_release_cancels_long_press() {
        let h = start();
        settle().await;

        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        sleep(Duration::from_millis(1500)).await;
        h.key_tx.send(key(KeyTransition::Up)).unwrap();
        sleep(Duration::from_millis(3000)).await;

        assert!(!h.controller.snapshot().await.shutting_down);
        assert_eq!(mode(&h, LteRed).await, SlowFlash);
    }

    #[tokio::test(start_paused = true)]
    async fn release_queued_with_the_deadline_cancels_long_press() {
        for _ in 0..20 {
            let h = start();
            settle().await;

            let down = key(KeyTransition::Down);
            h.key_tx.send(down).unwrap();
            settle().await;

            // Release read just before the deadline, handled on the same poll
            // that sees the timer expire.
            h.key_tx
                .send(KeyEvent {
                    transition: KeyTransition::Up,
                    at: down.at + Duration::from_millis(1999),
                })
                .unwrap();
            tokio::time::advance(Duration::from_millis(1990)).await;
            settle().await;

            assert!(!h.controller.snapshot().await.shutting_down);
            sleep(Duration::from_millis(5000)).await;
            assert!(h.runner.calls().is_empty());
            h.cancel.cancel();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn double_click_toggles_led_enablement() {
        let mut h = start();
        settle().await;

        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        sleep(Duration::from_millis(100)).await;
        h.key_tx.send(key(KeyTransition::Up)).unwrap();
        sleep(Duration::from_millis(200)).await;
        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        settle().await;
        h.key_tx.send(key(KeyTransition::Up)).unwrap();
        settle().await;

        assert!(!h.power_key.is_led_enabled());
        assert!(LedChannel::ALL.iter().all(|c| h.sink.last(*c) == Some(0)));

        // no long press fires after the double click
        sleep(Duration::from_millis(2500)).await;
        assert!(!h.controller.snapshot().await.shutting_down);

        // disabled LEDs track status without painting
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        settle().await;
        assert_eq!(mode(&h, WifiGreen).await, Off);

        let mut gestures = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let Event::GestureDetected(g) = event {
                gestures.push(g);
            }
        }
        assert_eq!(gestures, vec![Gesture::DoubleClick]);

        // second double click re-enables and repaints
        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        h.key_tx.send(key(KeyTransition::Up)).unwrap();
        h.key_tx.send(key(KeyTransition::Down)).unwrap();
        settle().await;
        assert!(h.power_key.is_led_enabled());
        assert_eq!(mode(&h, WifiGreen).await, SlowFlash);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_turns_everything_off() {
        let h = start();
        h.status_tx.send(StatusEvent::Wifi(true)).unwrap();
        settle().await;
        h.controller.set_brightness(WifiGreen, 200).unwrap();
        settle().await;
        assert_eq!(h.sink.last(WifiGreen), Some(200));

        h.cancel.cancel();
        settle().await;
        assert_eq!(h.sink.last(WifiGreen), Some(0));
        assert!(h.controller.all_off().is_err());
    }
}
