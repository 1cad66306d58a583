//! DS3231 real-time clock and temperature sensor over I2C.
//!
//! The time block is seven BCD registers starting at 0x00 (seconds, minutes,
//! hours, day, date, month, year). Temperature is a big-endian signed
//! fixed-point pair at 0x11–0x12 with 1/256 °C resolution.
//!
//! The `i2c` feature gates the real rppal bus; without it a mock register
//! file stands in for the device.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "i2c")]
use rppal::i2c::I2c;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BusError, BusOp, ClockError, ClockResult};

// ── DS3231 register addresses ───────────────────────────────────────────────

pub(crate) const DS3231_ADDR: u16 = 0x68;

const REG_SECONDS: u8 = 0x00;
const REG_CONTROL: u8 = 0x0E;
const REG_STATUS: u8 = 0x0F;
const REG_TEMP_MSB: u8 = 0x11;

/// Control register bit 7: oscillator disabled while on battery.
const EOSC_BIT: u8 = 1 << 7;
/// Status register bit 7: oscillator stopped at some point.
const OSF_BIT: u8 = 1 << 7;

/// Value bits of each time register, in register order. Everything else is
/// a mode flag or reserved (hours is always read as 24-hour).
const TIME_MASKS: [u8; 7] = [0x7F, 0x7F, 0x3F, 0x07, 0x3F, 0x1F, 0xFF];

const YEAR_BASE: u16 = 2000;

// ── BCD / fixed-point codecs ────────────────────────────────────────────────

/// Pack a decimal value 0–99 into two BCD nibbles.
pub(crate) fn bcd_encode(dec: u8) -> u8 {
    (dec / 10) * 16 + dec % 10
}

pub(crate) fn bcd_decode(bcd: u8) -> u8 {
    (bcd / 16) * 10 + bcd % 16
}

/// Degrees Celsius from the MSB/LSB temperature register pair.
pub(crate) fn temperature_from_registers(raw: [u8; 2]) -> f32 {
    f32::from(i16::from_be_bytes(raw)) / 256.0
}

// ── Clock reading ───────────────────────────────────────────────────────────

/// Calendar time as held by the RTC. `day` is the day of week, 1 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct ClockReading {
    pub(crate) seconds: u8,
    pub(crate) minutes: u8,
    pub(crate) hours: u8,
    pub(crate) day: u8,
    pub(crate) date: u8,
    pub(crate) month: u8,
    pub(crate) year: u16,
}

impl ClockReading {
    /// Check every field range, reporting all violations at once.
    pub(crate) fn validate(&self) -> ClockResult<()> {
        let mut errors: Vec<String> = Vec::new();
        let mut check = |name: &str, value: u16, lo: u16, hi: u16| {
            if !(lo..=hi).contains(&value) {
                errors.push(format!("{name} {value} out of range [{lo}, {hi}]"));
            }
        };

        check("seconds", self.seconds.into(), 0, 59);
        check("minutes", self.minutes.into(), 0, 59);
        check("hours", self.hours.into(), 0, 23);
        check("day", self.day.into(), 1, 7);
        check("date", self.date.into(), 1, 31);
        check("month", self.month.into(), 1, 12);
        check("year", self.year, YEAR_BASE, YEAR_BASE + 99);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClockError::InvalidArgument(errors.join(", ")))
        }
    }

    /// BCD register image, seconds first. Caller must have validated.
    fn to_registers(self) -> [u8; 7] {
        [
            bcd_encode(self.seconds),
            bcd_encode(self.minutes),
            bcd_encode(self.hours),
            bcd_encode(self.day),
            bcd_encode(self.date),
            bcd_encode(self.month),
            bcd_encode((self.year - YEAR_BASE) as u8),
        ]
    }

    fn from_registers(raw: [u8; 7]) -> Self {
        let f = |i: usize| bcd_decode(raw[i] & TIME_MASKS[i]);
        Self {
            seconds: f(0),
            minutes: f(1),
            hours: f(2),
            day: f(3),
            date: f(4),
            month: f(5),
            year: YEAR_BASE + u16::from(f(6)),
        }
    }

    pub(crate) fn from_datetime(dt: OffsetDateTime) -> Self {
        Self {
            seconds: dt.second(),
            minutes: dt.minute(),
            hours: dt.hour(),
            day: dt.weekday().number_from_sunday(),
            date: dt.day(),
            month: u8::from(dt.month()),
            year: u16::try_from(dt.year()).unwrap_or(0),
        }
    }

    /// `HH:MM:SS`.
    pub(crate) fn time_string(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

// ── Bus abstraction ─────────────────────────────────────────────────────────

/// Byte-register access to one device on a two-wire bus.
pub(crate) trait RegisterBus: Send {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError>;

    /// Read `buf.len()` consecutive registers from `start` in one
    /// write-then-read transaction.
    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), BusError>;
}

/// Where the RTC lives on the two-wire bus.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// I2C bus number (`/dev/i2c-<bus>`).
    pub bus: u8,
    pub address: u16,
    pub clock_hz: u32,
    /// Write the system clock into the RTC once at startup.
    pub set_from_system: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus: 1,
            address: DS3231_ADDR,
            clock_hz: 100_000,
            set_from_system: false,
        }
    }
}

#[cfg(feature = "i2c")]
struct RppalBus {
    i2c: I2c,
}

#[cfg(feature = "i2c")]
impl RppalBus {
    fn open(config: &BusConfig) -> ClockResult<Self> {
        let config_err = |e: rppal::i2c::Error| ClockError::BusConfig(e.to_string());

        let mut i2c = I2c::with_bus(config.bus).map_err(config_err)?;
        i2c.set_slave_address(config.address).map_err(config_err)?;

        // The Linux driver fixes the bus speed in the device tree.
        let actual = i2c.clock_speed().map_err(config_err)?;
        if actual != config.clock_hz {
            tracing::warn!(
                requested = config.clock_hz,
                actual,
                "i2c clock speed differs from config (set it in the device tree)"
            );
        }

        tracing::info!(
            bus = config.bus,
            addr = format_args!("0x{:02x}", config.address),
            clock_hz = actual,
            "i2c bus opened"
        );
        Ok(Self { i2c })
    }
}

#[cfg(feature = "i2c")]
impl RegisterBus for RppalBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.i2c
            .write(&[register, value])
            .map(|_| ())
            .map_err(|e| BusError::write(register, e.to_string()))
    }

    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.i2c
            .write_read(&[start], buf)
            .map_err(|e| BusError::read(start, e.to_string()))
    }
}

// ── Mock register file (development and tests) ──────────────────────────────

struct RegisterFile {
    regs: [u8; 256],
    writes: Vec<(u8, u8)>,
    failing_reads: HashSet<u8>,
    failing_writes: HashSet<u8>,
}

/// In-memory DS3231 stand-in. Clones share the same register file so tests
/// can inspect writes and inject failures after handing the bus over.
#[derive(Clone)]
pub(crate) struct MockBus {
    file: Arc<Mutex<RegisterFile>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self {
            file: Arc::new(Mutex::new(RegisterFile {
                regs: [0; 256],
                writes: Vec::new(),
                failing_reads: HashSet::new(),
                failing_writes: HashSet::new(),
            })),
        }
    }
}

#[cfg_attr(feature = "i2c", allow(dead_code))]
impl MockBus {
    fn with_file<R>(&self, f: impl FnOnce(&mut RegisterFile) -> R) -> R {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut file)
    }

    /// A register file holding the current system time and 25.25 °C.
    pub(crate) fn seeded_from_system() -> Self {
        let bus = Self::default();
        let now = ClockReading::from_datetime(OffsetDateTime::now_utc());
        if now.validate().is_ok() {
            bus.load(REG_SECONDS, &now.to_registers());
        }
        bus.load(REG_TEMP_MSB, &[0x19, 0x40]);
        bus
    }

    /// Preload registers without recording them as writes.
    pub(crate) fn load(&self, start: u8, bytes: &[u8]) {
        self.with_file(|file| {
            for (reg, b) in file.regs[usize::from(start)..].iter_mut().zip(bytes) {
                *reg = *b;
            }
        });
    }
}

#[cfg(test)]
impl MockBus {
    pub(crate) fn register(&self, addr: u8) -> u8 {
        self.with_file(|file| file.regs[usize::from(addr)])
    }

    /// Every `(register, value)` written through the bus, in order.
    pub(crate) fn writes(&self) -> Vec<(u8, u8)> {
        self.with_file(|file| file.writes.clone())
    }

    /// Make block reads starting at `start` fail (or succeed again).
    pub(crate) fn fail_reads_at(&self, start: u8, fail: bool) {
        self.with_file(|file| {
            if fail {
                file.failing_reads.insert(start);
            } else {
                file.failing_reads.remove(&start);
            }
        });
    }

    pub(crate) fn fail_writes_at(&self, register: u8) {
        self.with_file(|file| {
            file.failing_writes.insert(register);
        });
    }
}

impl RegisterBus for MockBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.with_file(|file| {
            if file.failing_writes.contains(&register) {
                return Err(BusError::write(register, "mock: injected nack"));
            }
            file.regs[usize::from(register)] = value;
            file.writes.push((register, value));
            Ok(())
        })
    }

    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.with_file(|file| {
            if file.failing_reads.contains(&start) {
                return Err(BusError::read(start, "mock: injected nack"));
            }
            let from = usize::from(start);
            let Some(src) = file.regs.get(from..from + buf.len()) else {
                return Err(BusError::read(start, "mock: read past end of register file"));
            };
            buf.copy_from_slice(src);
            Ok(())
        })
    }
}

/// Open the platform bus selected by cargo features.
fn open_bus(config: &BusConfig) -> ClockResult<Box<dyn RegisterBus>> {
    #[cfg(feature = "i2c")]
    {
        Ok(Box::new(RppalBus::open(config)?))
    }
    #[cfg(not(feature = "i2c"))]
    {
        tracing::info!(
            bus = config.bus,
            addr = format_args!("0x{:02x}", config.address),
            clock_hz = config.clock_hz,
            "[mock-i2c] rtc is simulated (no hardware)"
        );
        Ok(Box::new(MockBus::seeded_from_system()))
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// DS3231 driver. Every bus transaction holds the internal mutex, so one
/// `Arc<ClockSensor>` can be shared between tasks.
pub(crate) struct ClockSensor {
    bus: Mutex<Option<Box<dyn RegisterBus>>>,
}

impl ClockSensor {
    /// Open the configured bus and run the oscillator handshake.
    pub(crate) fn init(config: &BusConfig) -> ClockResult<Self> {
        let bus = open_bus(config)?;
        Self::with_bus(bus)
    }

    /// Run the oscillator handshake over an already opened bus.
    pub(crate) fn with_bus(mut bus: Box<dyn RegisterBus>) -> ClockResult<Self> {
        ensure_oscillator(bus.as_mut()).map_err(ClockError::Device)?;
        tracing::info!("ds3231 initialised");
        Ok(Self {
            bus: Mutex::new(Some(bus)),
        })
    }

    fn transact<R>(
        &self,
        op: BusOp,
        f: impl FnOnce(&mut dyn RegisterBus) -> Result<R, BusError>,
    ) -> Result<R, BusError> {
        let mut guard = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        let bus = guard.as_mut().ok_or_else(|| BusError::released(op))?;
        f(bus.as_mut())
    }

    /// Validate and write all seven time registers. A failing write leaves
    /// the earlier registers updated.
    pub(crate) fn set_time(&self, reading: &ClockReading) -> ClockResult<()> {
        reading.validate()?;
        let image = reading.to_registers();

        self.transact(BusOp::Write, |bus| {
            for (offset, value) in (REG_SECONDS..).zip(image) {
                bus.write_register(offset, value)?;
            }
            Ok(())
        })
        .inspect_err(|e| tracing::error!("rtc set_time failed: {e}"))?;

        tracing::info!(
            "rtc time set: {:04}-{:02}-{:02} {}",
            reading.year,
            reading.month,
            reading.date,
            reading.time_string()
        );
        Ok(())
    }

    pub(crate) fn get_time(&self) -> ClockResult<ClockReading> {
        let mut raw = [0u8; 7];
        self.transact(BusOp::Read, |bus| bus.read_registers(REG_SECONDS, &mut raw))
            .inspect_err(|e| tracing::error!("rtc get_time failed: {e}"))?;

        let reading = ClockReading::from_registers(raw);
        // Masked fields can still hold non-decimal nibbles (e.g. 0x3F hours).
        reading.validate().map_err(|e| {
            BusError::read(REG_SECONDS, format!("implausible time registers {raw:02x?}: {e}"))
        })?;
        tracing::debug!(time = %reading.time_string(), "rtc time read");
        Ok(reading)
    }

    pub(crate) fn get_temperature(&self) -> ClockResult<f32> {
        let mut raw = [0u8; 2];
        self.transact(BusOp::Read, |bus| bus.read_registers(REG_TEMP_MSB, &mut raw))
            .inspect_err(|e| tracing::error!("rtc get_temperature failed: {e}"))?;

        let celsius = temperature_from_registers(raw);
        tracing::debug!(celsius, "rtc temperature read");
        Ok(celsius)
    }

    /// Release the bus driver. Later transactions fail with a bus error.
    pub(crate) fn deinit(&self) -> ClockResult<()> {
        let mut guard = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(bus) => {
                drop(bus);
                tracing::info!("ds3231 deinitialised");
                Ok(())
            }
            None => Err(BusError::released(BusOp::Release).into()),
        }
    }
}

/// Clear a latched oscillator-stop flag and keep the oscillator running on
/// battery.
fn ensure_oscillator(bus: &mut dyn RegisterBus) -> Result<(), BusError> {
    let mut status = [0u8; 1];
    bus.read_registers(REG_STATUS, &mut status)?;
    if status[0] & OSF_BIT != 0 {
        tracing::warn!("rtc oscillator was stopped, clearing flag (time may be invalid)");
        bus.write_register(REG_STATUS, status[0] & !OSF_BIT)?;
    }

    let mut control = [0u8; 1];
    bus.read_registers(REG_CONTROL, &mut control)?;
    if control[0] & EOSC_BIT != 0 {
        tracing::info!("enabling rtc oscillator on battery");
        bus.write_register(REG_CONTROL, control[0] & !EOSC_BIT)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
