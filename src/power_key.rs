//! Power button handling.
//!
//! A dedicated thread blocks on the input device and forwards key
//! transitions; gesture classification and timers run on the aggregator loop.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};

pub const KEY_POWER: u16 = 116;
pub const LONG_PRESS: Duration = Duration::from_millis(2000);
pub const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(500);

const EV_KEY: u16 = 1;

/// Size of `struct input_event`: two kernel longs of timestamp followed by
/// type, code and value. 32-bit userlands with a 64-bit `time_t` still read
/// the 16-byte layout; the UAPI header switches them to `__kernel_ulong_t`
/// seconds.
#[cfg(target_pointer_width = "64")]
pub const INPUT_EVENT_SIZE: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
pub const INPUT_EVENT_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let body = raw.get(INPUT_EVENT_SIZE - 8..INPUT_EVENT_SIZE)?;
        Some(Self {
            kind: u16::from_ne_bytes([body[0], body[1]]),
            code: u16::from_ne_bytes([body[2], body[3]]),
            value: i32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
        })
    }

    /// Down/Up for the watched key; autorepeat and other events yield `None`.
    pub fn transition(&self, key_code: u16) -> Option<KeyTransition> {
        if self.kind != EV_KEY || self.code != key_code {
            return None;
        }
        match self.value {
            1 => Some(KeyTransition::Down),
            0 => Some(KeyTransition::Up),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransition {
    Down,
    Up,
}

/// A key transition stamped when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub transition: KeyTransition,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gesture {
    LongPress,
    DoubleClick,
}

impl Gesture {
    pub fn as_str(self) -> &'static str {
        match self {
            Gesture::LongPress => "long-press",
            Gesture::DoubleClick => "double-click",
        }
    }
}

/// What the loop must do after a key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    ArmLongPress(Instant),
    CancelLongPress,
    Emit(Gesture),
}

#[derive(Debug, Clone, Copy)]
pub struct GestureTiming {
    pub long_press: Duration,
    pub double_click: Duration,
}

impl Default for GestureTiming {
    fn default() -> Self {
        Self {
            long_press: LONG_PRESS,
            double_click: DOUBLE_CLICK_WINDOW,
        }
    }
}

/// Click counter and release clock behind the gestures.
#[derive(Debug)]
pub struct GestureClassifier {
    timing: GestureTiming,
    last_release: Option<Instant>,
    clicks: u8,
}

impl GestureClassifier {
    pub fn new(timing: GestureTiming) -> Self {
        Self {
            timing,
            last_release: None,
            clicks: 0,
        }
    }

    pub fn on_down(&mut self, at: Instant) -> KeyAction {
        let quick_repeat = self
            .last_release
            .is_some_and(|released| at.saturating_duration_since(released) < self.timing.double_click);

        if quick_repeat {
            self.clicks = self.clicks.saturating_add(1);
            if self.clicks >= 2 {
                self.clicks = 0;
                self.last_release = None;
                return KeyAction::Emit(Gesture::DoubleClick);
            }
        } else {
            self.clicks = 1;
        }

        KeyAction::ArmLongPress(at + self.timing.long_press)
    }

    pub fn on_up(&mut self, at: Instant) -> KeyAction {
        self.last_release = Some(at);
        KeyAction::CancelLongPress
    }

    /// Called when an armed long-press timer fires.
    pub fn on_long_press(&mut self) -> Gesture {
        self.clicks = 0;
        self.last_release = None;
        Gesture::LongPress
    }
}

/// Shared view of the power key feature.
#[derive(Debug, Clone)]
pub struct PowerKeyMonitor {
    led_enabled: Arc<AtomicBool>,
    available: Arc<AtomicBool>,
}

impl Default for PowerKeyMonitor {
    fn default() -> Self {
        Self {
            led_enabled: Arc::new(AtomicBool::new(true)),
            available: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PowerKeyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_led_enabled(&self) -> bool {
        self.led_enabled.load(Ordering::SeqCst)
    }

    /// Flips LED enablement and returns the new value.
    pub fn toggle_led_enabled(&self) -> bool {
        !self.led_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Whether an input device was opened.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Opens the first usable device and starts the reader thread.
    ///
    /// Returns `None` (feature disabled) when no device can be opened.
    pub fn start(
        &self,
        devices: &[PathBuf],
        key_code: u16,
        events: mpsc::UnboundedSender<KeyEvent>,
    ) -> Option<JoinHandle<()>> {
        let Some((path, device)) = open_first(devices) else {
            warn!("No power key input device could be opened, gestures disabled");
            return None;
        };

        let name = device_label(&path);
        match thread::Builder::new()
            .name("power-key".to_string())
            .spawn(move || read_loop(device, key_code, events))
        {
            Ok(handle) => {
                info!("Power key reader started on {name}");
                self.available.store(true, Ordering::SeqCst);
                Some(handle)
            }
            Err(e) => {
                error!("Failed to spawn power key reader: {e}");
                None
            }
        }
    }
}

fn open_first(devices: &[PathBuf]) -> Option<(PathBuf, File)> {
    devices.iter().find_map(|path| match File::open(path) {
        Ok(file) => Some((path.clone(), file)),
        Err(e) => {
            debug!("Cannot open {}: {e}", path.display());
            None
        }
    })
}

fn read_loop(mut device: impl Read, key_code: u16, events: mpsc::UnboundedSender<KeyEvent>) {
    let mut raw = [0u8; INPUT_EVENT_SIZE];

    loop {
        if let Err(e) = device.read_exact(&mut raw) {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                error!("Power key read failed: {e}");
            }
            break;
        }

        let Some(transition) = InputEvent::parse(&raw).and_then(|ev| ev.transition(key_code))
        else {
            continue;
        };

        let event = KeyEvent {
            transition,
            at: Instant::now(),
        };
        if events.send(event).is_err() {
            break;
        }
    }

    info!("Power key reader stopped");
}

/// Name used in logs for a device path.
pub fn device_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn raw_event(kind: u16, code: u16, value: i32) -> Vec<u8> {
        let mut raw = vec![0u8; INPUT_EVENT_SIZE - 8];
        raw.extend_from_slice(&kind.to_ne_bytes());
        raw.extend_from_slice(&code.to_ne_bytes());
        raw.extend_from_slice(&value.to_ne_bytes());
        raw
    }

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    #[test]
    fn parses_key_transitions() {
        let down = InputEvent::parse(&raw_event(EV_KEY, KEY_POWER, 1)).unwrap();
        assert_eq!(down.transition(KEY_POWER), Some(KeyTransition::Down));

        let up = InputEvent::parse(&raw_event(EV_KEY, KEY_POWER, 0)).unwrap();
        assert_eq!(up.transition(KEY_POWER), Some(KeyTransition::Up));

        let repeat = InputEvent::parse(&raw_event(EV_KEY, KEY_POWER, 2)).unwrap();
        assert_eq!(repeat.transition(KEY_POWER), None);

        let other_key = InputEvent::parse(&raw_event(EV_KEY, 115, 1)).unwrap();
        assert_eq!(other_key.transition(KEY_POWER), None);

        let sync = InputEvent::parse(&raw_event(0, 0, 0)).unwrap();
        assert_eq!(sync.transition(KEY_POWER), None);

        assert_eq!(InputEvent::parse(&[0u8; 4]), None);
    }

    #[test]
    fn down_up_down_within_window_is_double_click() {
        let t0 = Instant::now();
        let mut classifier = GestureClassifier::new(GestureTiming::default());

        assert_eq!(classifier.on_down(t0), KeyAction::ArmLongPress(ms(t0, 2000)));
        assert_eq!(classifier.on_up(ms(t0, 100)), KeyAction::CancelLongPress);
        assert_eq!(
            classifier.on_down(ms(t0, 300)),
            KeyAction::Emit(Gesture::DoubleClick)
        );

        // the next press starts a fresh sequence
        assert_eq!(classifier.on_up(ms(t0, 350)), KeyAction::CancelLongPress);
        assert_eq!(
            classifier.on_down(ms(t0, 2000)),
            KeyAction::ArmLongPress(ms(t0, 4000))
        );
    }

    #[test]
    fn slow_second_press_rearms_long_press() {
        let t0 = Instant::now();
        let mut classifier = GestureClassifier::new(GestureTiming::default());

        classifier.on_down(t0);
        classifier.on_up(ms(t0, 100));
        assert_eq!(
            classifier.on_down(ms(t0, 700)),
            KeyAction::ArmLongPress(ms(t0, 2700))
        );
    }

    #[test]
    fn long_press_resets_click_state() {
        let t0 = Instant::now();
        let mut classifier = GestureClassifier::new(GestureTiming::default());

        classifier.on_down(t0);
        assert_eq!(classifier.on_long_press(), Gesture::LongPress);
        classifier.on_up(ms(t0, 2100));
        assert_eq!(
            classifier.on_down(ms(t0, 2200)),
            KeyAction::ArmLongPress(ms(t0, 4200))
        );
    }

    #[test]
    fn led_enabled_toggles() {
        let monitor = PowerKeyMonitor::new();
        assert!(monitor.is_led_enabled());
        assert!(!monitor.toggle_led_enabled());
        assert!(!monitor.is_led_enabled());
        assert!(monitor.clone().toggle_led_enabled());
        assert!(monitor.is_led_enabled());
    }

    #[test]
    fn missing_devices_disable_the_feature() {
        let monitor = PowerKeyMonitor::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let devices = vec![PathBuf::from("/nonexistent/event0")];
        assert!(monitor.start(&devices, KEY_POWER, tx).is_none());
        assert!(!monitor.is_available());
    }

    #[test]
    fn reader_forwards_only_power_key_transitions() {
        let mut stream = Vec::new();
        stream.extend(raw_event(EV_KEY, KEY_POWER, 1));
        stream.extend(raw_event(0, 0, 0));
        stream.extend(raw_event(EV_KEY, 30, 1));
        stream.extend(raw_event(EV_KEY, KEY_POWER, 2));
        stream.extend(raw_event(EV_KEY, KEY_POWER, 0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(Cursor::new(stream), KEY_POWER, tx);

        let transitions: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.transition)
            .collect();
        assert_eq!(transitions, vec![KeyTransition::Down, KeyTransition::Up]);
    }

    #[test]
    fn reader_thread_runs_on_a_device_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("event0");
        std::fs::write(&device, raw_event(EV_KEY, KEY_POWER, 1)).unwrap();

        let monitor = PowerKeyMonitor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = monitor
            .start(&[PathBuf::from("/nonexistent"), device.clone()], KEY_POWER, tx)
            .unwrap();
        handle.join().unwrap();

        assert!(monitor.is_available());
        assert_eq!(rx.try_recv().unwrap().transition, KeyTransition::Down);
        assert_eq!(device_label(&device), "event0");
    }
}
