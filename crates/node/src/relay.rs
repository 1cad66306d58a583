//! Relay bank over GPIO outputs. The `gpio` feature gates the real rppal
//! driver; without it, a mock pin driver records levels and logs them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Number of relay channels on the board.
pub(crate) const CHANNEL_COUNT: usize = 3;

pub(crate) type SharedRelays = Arc<tokio::sync::Mutex<ActuatorBank>>;

/// Physical level on an output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    High,
    Low,
}

/// Digital output driver behind the relay bank.
pub(crate) trait OutputPins: Send {
    /// Claim `pin` and configure it as a push-pull output.
    fn configure_output(&mut self, pin: u8) -> anyhow::Result<()>;

    /// Drive a previously configured pin. Unknown pins are ignored.
    fn write(&mut self, pin: u8, level: Level);
}

/// Open the platform pin driver selected by cargo features.
pub(crate) fn open_pins() -> anyhow::Result<Box<dyn OutputPins>> {
    #[cfg(feature = "gpio")]
    {
        Ok(Box::new(GpioPins::new()?))
    }
    #[cfg(not(feature = "gpio"))]
    {
        tracing::info!("[mock-gpio] relay outputs are not wired to hardware");
        Ok(Box::new(MockPins::default()))
    }
}

// ---------------------------------------------------------------------------
// Real GPIO pins (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub(crate) struct GpioPins {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
}

#[cfg(feature = "gpio")]
impl GpioPins {
    pub(crate) fn new() -> anyhow::Result<Self> {
        Ok(Self {
            gpio: Gpio::new()?,
            pins: HashMap::new(),
        })
    }
}

#[cfg(feature = "gpio")]
impl OutputPins for GpioPins {
    fn configure_output(&mut self, pin: u8) -> anyhow::Result<()> {
        let out = self.gpio.get(pin)?.into_output();
        self.pins.insert(pin, out);
        Ok(())
    }

    fn write(&mut self, pin: u8, level: Level) {
        if let Some(out) = self.pins.get_mut(&pin) {
            match level {
                Level::High => out.set_high(),
                Level::Low => out.set_low(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pins (development and tests: no hardware, records every write)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PinLog {
    levels: HashMap<u8, Level>,
    configured: Vec<u8>,
    writes: usize,
}

/// Cloneable handle; clones share the same recorded pin levels.
#[derive(Clone, Default)]
#[cfg_attr(feature = "gpio", allow(dead_code))]
pub(crate) struct MockPins {
    log: Arc<Mutex<PinLog>>,
}

#[cfg_attr(feature = "gpio", allow(dead_code))]
impl MockPins {
    fn with_log<R>(&self, f: impl FnOnce(&mut PinLog) -> R) -> R {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut log)
    }
}

#[cfg(test)]
impl MockPins {
    /// Last level written to `pin`, if any.
    pub(crate) fn level(&self, pin: u8) -> Option<Level> {
        self.with_log(|log| log.levels.get(&pin).copied())
    }

    /// Total number of pin writes so far.
    pub(crate) fn writes(&self) -> usize {
        self.with_log(|log| log.writes)
    }
}

impl OutputPins for MockPins {
    fn configure_output(&mut self, pin: u8) -> anyhow::Result<()> {
        self.with_log(|log| log.configured.push(pin));
        tracing::debug!(pin, "[mock-gpio] pin configured as output");
        Ok(())
    }

    fn write(&mut self, pin: u8, level: Level) {
        self.with_log(|log| {
            if log.configured.contains(&pin) {
                log.levels.insert(pin, level);
                log.writes += 1;
            }
        });
        tracing::debug!(pin, ?level, "[mock-gpio] pin written");
    }
}

// ---------------------------------------------------------------------------
// Actuator bank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct RelayChannel {
    pin: u8,
    active_high: bool,
    on: bool,
    initialized: bool,
}

/// Fixed-size bank of relay channels, addressed by index.
///
/// Every operation on an out-of-range or uninitialized channel is a no-op;
/// `get` reports `false` for those.
pub(crate) struct ActuatorBank {
    pins: Box<dyn OutputPins>,
    channels: [RelayChannel; CHANNEL_COUNT],
}

/// Pin level that realises logical state `on` for the given polarity.
fn level_for(active_high: bool, on: bool) -> Level {
    if active_high == on {
        Level::High
    } else {
        Level::Low
    }
}

impl ActuatorBank {
    pub(crate) fn new(pins: Box<dyn OutputPins>) -> Self {
        Self {
            pins,
            channels: [RelayChannel::default(); CHANNEL_COUNT],
        }
    }

    /// Bind `channel` to `pin` with the given polarity and force it OFF.
    pub(crate) fn init(&mut self, channel: usize, pin: u8, active_high: bool) {
        if channel >= CHANNEL_COUNT {
            tracing::warn!(relay = channel, "relay index out of range, not initialised");
            return;
        }
        if let Err(e) = self.pins.configure_output(pin) {
            tracing::error!(relay = channel, pin, "failed to claim relay pin: {e:#}");
            return;
        }

        self.channels[channel] = RelayChannel {
            pin,
            active_high,
            on: false,
            initialized: true,
        };
        self.set(channel, false);
        tracing::info!(relay = channel, pin, active_high, "relay initialised");
    }

    pub(crate) fn set(&mut self, channel: usize, on: bool) {
        let Some(ch) = self.channels.get_mut(channel).filter(|c| c.initialized) else {
            return;
        };
        self.pins.write(ch.pin, level_for(ch.active_high, on));
        ch.on = on;
        tracing::debug!(relay = channel, on, "relay set");
    }

    pub(crate) fn toggle(&mut self, channel: usize) {
        let on = self.get(channel);
        self.set(channel, !on);
    }

    pub(crate) fn get(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.initialized && c.on)
            .unwrap_or(false)
    }

    /// Logical state of every channel, in index order.
    pub(crate) fn states(&self) -> [bool; CHANNEL_COUNT] {
        std::array::from_fn(|i| self.get(i))
    }

    /// Drive every initialised channel OFF.
    pub(crate) fn all_off(&mut self) {
        for i in 0..CHANNEL_COUNT {
            self.set(i, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> (ActuatorBank, MockPins) {
        let pins = MockPins::default();
        (ActuatorBank::new(Box::new(pins.clone())), pins)
    }

    // -- init ---------------------------------------------------------------

    #[test]
    fn init_forces_off_active_high() {
        let (mut bank, pins) = bank();
        bank.init(0, 25, true);
        assert!(!bank.get(0));
        assert_eq!(pins.level(25), Some(Level::Low));
    }

    #[test]
    fn init_forces_off_active_low() {
        let (mut bank, pins) = bank();
        bank.init(1, 32, false);
        assert!(!bank.get(1));
        assert_eq!(pins.level(32), Some(Level::High));
    }

    #[test]
    fn init_out_of_range_is_noop() {
        let (mut bank, pins) = bank();
        bank.init(CHANNEL_COUNT, 25, true);
        assert_eq!(pins.writes(), 0);
        assert_eq!(pins.level(25), None);
    }

    // -- set / polarity -----------------------------------------------------

    #[test]
    fn set_active_high_drives_high() {
        let (mut bank, pins) = bank();
        bank.init(0, 25, true);
        bank.set(0, true);
        assert!(bank.get(0));
        assert_eq!(pins.level(25), Some(Level::High));
    }

    #[test]
    fn set_active_low_drives_low_but_reports_on() {
        let (mut bank, pins) = bank();
        bank.init(2, 33, false);
        bank.set(2, true);
        assert_eq!(pins.level(33), Some(Level::Low));
        assert!(bank.get(2));
    }

    #[test]
    fn set_writes_exactly_once() {
        let (mut bank, pins) = bank();
        bank.init(0, 25, true);
        let before = pins.writes();
        bank.set(0, true);
        assert_eq!(pins.writes(), before + 1);
        bank.toggle(0);
        assert_eq!(pins.writes(), before + 2);
    }

    // -- toggle -------------------------------------------------------------

    #[test]
    fn toggle_flips_logical_state() {
        let (mut bank, pins) = bank();
        bank.init(1, 32, false);
        bank.toggle(1);
        assert!(bank.get(1));
        assert_eq!(pins.level(32), Some(Level::Low));
        bank.toggle(1);
        assert!(!bank.get(1));
        assert_eq!(pins.level(32), Some(Level::High));
    }

    // -- bounds -------------------------------------------------------------

    #[test]
    fn out_of_range_operations_do_not_panic() {
        let (mut bank, pins) = bank();
        bank.set(CHANNEL_COUNT, true);
        bank.set(usize::MAX, true);
        bank.toggle(99);
        assert!(!bank.get(CHANNEL_COUNT));
        assert!(!bank.get(usize::MAX));
        assert_eq!(pins.writes(), 0);
    }

    #[test]
    fn uninitialized_channel_is_noop() {
        let (mut bank, pins) = bank();
        bank.init(0, 25, true);
        let before = pins.writes();
        bank.set(1, true);
        bank.toggle(2);
        assert!(!bank.get(1));
        assert!(!bank.get(2));
        assert_eq!(pins.writes(), before);
    }

    // -- aggregate ----------------------------------------------------------

    #[test]
    fn states_and_all_off() {
        let (mut bank, _pins) = bank();
        bank.init(0, 25, true);
        bank.init(1, 32, true);
        bank.init(2, 33, true);
        bank.set(0, true);
        bank.set(2, true);
        assert_eq!(bank.states(), [true, false, true]);
        bank.all_off();
        assert_eq!(bank.states(), [false, false, false]);
    }
}
