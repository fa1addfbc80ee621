//! Status LED table and its sysfs output.

use std::{
    fs, io,
    path::PathBuf,
};

use log::{debug, warn};
use serde::Serialize;

/// One of the ten status LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LedChannel {
    LteRed,
    LteGreen,
    LteBlue,
    NrRed,
    NrGreen,
    NrBlue,
    BatteryRed,
    BatteryGreen,
    WifiRed,
    WifiGreen,
}

impl LedChannel {
    pub const ALL: [LedChannel; 10] = [
        LedChannel::LteRed,
        LedChannel::LteGreen,
        LedChannel::LteBlue,
        LedChannel::NrRed,
        LedChannel::NrGreen,
        LedChannel::NrBlue,
        LedChannel::BatteryRed,
        LedChannel::BatteryGreen,
        LedChannel::WifiRed,
        LedChannel::WifiGreen,
    ];

    pub const REDS: [LedChannel; 4] = [
        LedChannel::LteRed,
        LedChannel::NrRed,
        LedChannel::BatteryRed,
        LedChannel::WifiRed,
    ];

    /// Directory name under the LED class root.
    pub fn sysfs_name(self) -> &'static str {
        match self {
            LedChannel::LteRed => "lte_red",
            LedChannel::LteGreen => "lte_green",
            LedChannel::LteBlue => "lte_blue",
            LedChannel::NrRed => "nr_red",
            LedChannel::NrGreen => "nr_green",
            LedChannel::NrBlue => "nr_blue",
            LedChannel::BatteryRed => "vbat_red",
            LedChannel::BatteryGreen => "vbat_green",
            LedChannel::WifiRed => "wifi_red",
            LedChannel::WifiGreen => "wifi_green",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }
}

/// How a channel is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LedMode {
    #[default]
    Off,
    On,
    /// 1000 ms period, 50 % duty.
    SlowFlash,
    /// 500 ms period, 50 % duty.
    FastFlash,
}

impl LedMode {
    /// Whether the channel is lit at the given render phase.
    ///
    /// A phase is one render tick (500 ms). Both flash modes are lit on even
    /// phases; the tick cannot resolve the fast half-period.
    pub fn is_lit(self, phase: u64) -> bool {
        match self {
            LedMode::Off => false,
            LedMode::On => true,
            LedMode::SlowFlash | LedMode::FastFlash => phase % 2 == 0,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(LedMode::Off),
            1 => Some(LedMode::On),
            2 => Some(LedMode::SlowFlash),
            3 => Some(LedMode::FastFlash),
            _ => None,
        }
    }
}

/// Output the LED table renders to.
pub trait LedSink: Send {
    /// Hands the channel over to software control.
    fn claim(&mut self, channel: LedChannel) -> io::Result<()>;

    fn write_brightness(&mut self, channel: LedChannel, value: u8) -> io::Result<()>;
}

/// LEDs exposed under `/sys/class/leds`.
pub struct SysfsLeds {
    root: PathBuf,
}

impl SysfsLeds {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn attribute(&self, channel: LedChannel, name: &str) -> PathBuf {
        self.root.join(channel.sysfs_name()).join(name)
    }
}

impl LedSink for SysfsLeds {
    fn claim(&mut self, channel: LedChannel) -> io::Result<()> {
        fs::write(self.attribute(channel, "trigger"), "none")
    }

    fn write_brightness(&mut self, channel: LedChannel, value: u8) -> io::Result<()> {
        fs::write(self.attribute(channel, "brightness"), value.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct LedNode {
    mode: LedMode,
    brightness: u8,
    /// Last value written; `None` forces the next render to write.
    written: Option<bool>,
}

impl Default for LedNode {
    fn default() -> Self {
        Self {
            mode: LedMode::Off,
            brightness: 1,
            written: None,
        }
    }
}

/// Rendered state of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedState {
    pub channel: LedChannel,
    pub name: &'static str,
    pub mode: LedMode,
    pub brightness: u8,
    pub lit: bool,
}

/// The ten channels and the render clock.
pub struct LedTable {
    nodes: [LedNode; 10],
    sink: Box<dyn LedSink>,
    phase: u64,
    force_every: u64,
}

impl LedTable {
    pub fn new(sink: Box<dyn LedSink>, force_every: u64) -> Self {
        Self {
            nodes: [LedNode::default(); 10],
            sink,
            phase: 0,
            force_every: force_every.max(1),
        }
    }

    /// Takes every channel under software control and switches it off.
    pub fn init(&mut self) {
        for channel in LedChannel::ALL {
            if let Err(e) = self.sink.claim(channel) {
                warn!("Cannot claim LED {}: {e}", channel.sysfs_name());
            }
            self.nodes[channel.index()].mode = LedMode::Off;
            self.write(channel, false);
        }
    }

    /// Changes a channel's mode. Steady modes are written at once; flashing
    /// modes are picked up by the next render tick.
    ///
    /// Returns false when the mode was already active.
    pub fn set_mode(&mut self, channel: LedChannel, mode: LedMode) -> bool {
        let node = &mut self.nodes[channel.index()];
        if node.mode == mode {
            return false;
        }
        node.mode = mode;

        match mode {
            LedMode::Off => self.write(channel, false),
            LedMode::On => self.write(channel, true),
            LedMode::SlowFlash | LedMode::FastFlash => {}
        }
        true
    }

    pub fn apply(&mut self, modes: &[(LedChannel, LedMode)]) {
        for (channel, mode) in modes {
            self.set_mode(*channel, *mode);
        }
    }

    /// Sets the lit brightness of a channel (at least 1).
    pub fn set_brightness(&mut self, channel: LedChannel, brightness: u8) {
        let node = &mut self.nodes[channel.index()];
        node.brightness = brightness.max(1);
        if node.written == Some(true) {
            self.write(channel, true);
        }
    }

    pub fn all_off(&mut self) {
        for channel in LedChannel::ALL {
            self.set_mode(channel, LedMode::Off);
        }
    }

    /// Advances the flash phase and writes channels whose value changed.
    /// Every `force_every`-th tick rewrites all channels.
    ///
    /// Returns the number of writes issued.
    pub fn render_tick(&mut self) -> usize {
        let phase = self.phase;
        let force = phase % self.force_every == 0;
        let mut writes = 0;

        for channel in LedChannel::ALL {
            let node = self.nodes[channel.index()];
            let lit = node.mode.is_lit(phase);
            if force || node.written != Some(lit) {
                self.write(channel, lit);
                writes += 1;
            }
        }

        self.phase = self.phase.wrapping_add(1);
        writes
    }

    pub fn snapshot(&self) -> Vec<LedState> {
        LedChannel::ALL
            .into_iter()
            .map(|channel| {
                let node = self.nodes[channel.index()];
                LedState {
                    channel,
                    name: channel.sysfs_name(),
                    mode: node.mode,
                    brightness: node.brightness,
                    lit: node.written.unwrap_or(false),
                }
            })
            .collect()
    }

    fn write(&mut self, channel: LedChannel, lit: bool) {
        let node = &mut self.nodes[channel.index()];
        let value = if lit { node.brightness } else { 0 };

        match self.sink.write_brightness(channel, value) {
            Ok(()) => node.written = Some(lit),
            Err(e) => {
                debug!("LED {} write failed: {e}", channel.sysfs_name());
                node.written = None;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn table() -> (RecordingSink, LedTable) {
        let sink = RecordingSink::default();
        let mut table = LedTable::new(Box::new(sink.clone()), 6);
        table.init();
        (sink, table)
    }

    #[test]
    fn init_claims_and_clears_every_channel() {
        let (sink, _table) = table();
        assert_eq!(sink.claimed.lock().unwrap().len(), 10);
        assert_eq!(sink.count(), 10);
        assert!(LedChannel::ALL.iter().all(|c| sink.last(*c) == Some(0)));
    }

    #[test]
    fn channel_indices_and_names() {
        for channel in LedChannel::ALL {
            assert_eq!(LedChannel::from_index(channel.index() as u8), Some(channel));
        }
        assert_eq!(LedChannel::from_index(10), None);
        assert_eq!(LedChannel::BatteryGreen.sysfs_name(), "vbat_green");
        assert!(LedChannel::REDS.iter().all(|c| c.sysfs_name().ends_with("red")));
    }

    #[test]
    fn steady_modes_write_immediately() {
        let (sink, mut table) = table();
        assert!(table.set_mode(LedChannel::LteGreen, LedMode::On));
        assert_eq!(sink.last(LedChannel::LteGreen), Some(1));

        let before = sink.count();
        assert!(!table.set_mode(LedChannel::LteGreen, LedMode::On));
        assert_eq!(sink.count(), before);

        table.set_mode(LedChannel::LteGreen, LedMode::SlowFlash);
        assert_eq!(sink.count(), before);
    }

    #[test]
    fn unchanged_state_only_writes_on_forced_ticks() {
        let (sink, mut table) = table();
        table.set_mode(LedChannel::BatteryRed, LedMode::On);

        // phase 0 is a forced rewrite
        assert_eq!(table.render_tick(), 10);
        for _ in 1..6 {
            table.apply(&[(LedChannel::BatteryRed, LedMode::On)]);
            assert_eq!(table.render_tick(), 0);
        }
        assert_eq!(table.render_tick(), 10);
        assert_eq!(sink.last(LedChannel::BatteryRed), Some(1));
    }

    #[test]
    fn flashing_channel_toggles_every_tick() {
        let (sink, mut table) = table();
        table.set_mode(LedChannel::WifiGreen, LedMode::SlowFlash);

        table.render_tick();
        assert_eq!(sink.last(LedChannel::WifiGreen), Some(1));
        assert_eq!(table.render_tick(), 1);
        assert_eq!(sink.last(LedChannel::WifiGreen), Some(0));
        assert_eq!(table.render_tick(), 1);
        assert_eq!(sink.last(LedChannel::WifiGreen), Some(1));
    }

    #[test]
    fn brightness_is_clamped_and_rewritten_when_lit() {
        let (sink, mut table) = table();
        table.set_mode(LedChannel::NrBlue, LedMode::On);
        table.set_brightness(LedChannel::NrBlue, 0);
        assert_eq!(sink.last(LedChannel::NrBlue), Some(1));
        table.set_brightness(LedChannel::NrBlue, 200);
        assert_eq!(sink.last(LedChannel::NrBlue), Some(200));

        table.set_brightness(LedChannel::NrRed, 50);
        assert_eq!(sink.last(LedChannel::NrRed), Some(0));
    }

    #[test]
    fn all_off_and_snapshot() {
        let (_sink, mut table) = table();
        table.set_mode(LedChannel::LteRed, LedMode::On);
        table.set_mode(LedChannel::NrRed, LedMode::FastFlash);
        table.all_off();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 10);
        assert!(snapshot.iter().all(|s| s.mode == LedMode::Off && !s.lit));
        assert_eq!(snapshot[0].name, "lte_red");
    }

    #[test]
    fn sysfs_leds_write_trigger_and_brightness() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("wifi_green")).unwrap();

        let mut leds = SysfsLeds::new(dir.path());
        leds.claim(LedChannel::WifiGreen).unwrap();
        leds.write_brightness(LedChannel::WifiGreen, 1).unwrap();

        let base = dir.path().join("wifi_green");
        assert_eq!(fs::read_to_string(base.join("trigger")).unwrap(), "none");
        assert_eq!(fs::read_to_string(base.join("brightness")).unwrap(), "1");
        assert!(leds.claim(LedChannel::LteRed).is_err());
    }

    #[test]
    fn failed_write_is_retried_next_tick() {
        struct Flaky {
            fail: bool,
        }
        impl LedSink for Flaky {
            fn claim(&mut self, _: LedChannel) -> io::Result<()> {
                Ok(())
            }
            fn write_brightness(&mut self, _: LedChannel, _: u8) -> io::Result<()> {
                if std::mem::take(&mut self.fail) {
                    Err(io::Error::other("busy"))
                } else {
                    Ok(())
                }
            }
        }

        let mut table = LedTable::new(Box::new(Flaky { fail: true }), 1000);
        table.set_mode(LedChannel::LteRed, LedMode::On);
        table.render_tick();
        // nothing changed after the retry succeeded
        assert_eq!(table.render_tick(), 0);
        assert!(table.snapshot()[0].lit);
    }

    proptest! {
        #[test]
        fn steady_modes_ignore_phase(phase in any::<u64>()) {
            prop_assert!(LedMode::On.is_lit(phase));
            prop_assert!(!LedMode::Off.is_lit(phase));
        }

        #[test]
        fn flash_modes_alternate(phase in 0u64..u64::MAX) {
            for mode in [LedMode::SlowFlash, LedMode::FastFlash] {
                prop_assert_ne!(mode.is_lit(phase), mode.is_lit(phase + 1));
            }
        }
    }
}
