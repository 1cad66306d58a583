//! Error types for the RTC peripheral path.
//!
//! Relay actuation has no error type: invalid channels degrade to no-ops.
//! Broker failures never surface as values either; they become
//! `ConnectionState` transitions in the gateway.

use thiserror::Error;

/// A single failed transaction on the two-wire register bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} at register 0x{register:02x} failed: {reason}")]
pub struct BusError {
    pub op: BusOp,
    pub register: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Read,
    Write,
    Release,
}

impl std::fmt::Display for BusOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Release => write!(f, "release"),
        }
    }
}

impl BusError {
    pub fn read(register: u8, reason: impl Into<String>) -> Self {
        Self {
            op: BusOp::Read,
            register,
            reason: reason.into(),
        }
    }

    pub fn write(register: u8, reason: impl Into<String>) -> Self {
        Self {
            op: BusOp::Write,
            register,
            reason: reason.into(),
        }
    }

    /// The bus driver has already been released by `deinit`.
    pub fn released(op: BusOp) -> Self {
        Self {
            op,
            register: 0,
            reason: "bus driver released".to_string(),
        }
    }
}

/// Errors returned by `ClockSensor` operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClockError {
    /// Rejected before any register was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// The bus driver could not be opened or configured.
    #[cfg_attr(not(feature = "i2c"), allow(dead_code))]
    #[error("bus configuration failed: {0}")]
    BusConfig(String),

    /// The device did not answer the status/control handshake during init.
    #[error("device error: {0}")]
    Device(BusError),
}

pub type ClockResult<T> = std::result::Result<T, ClockError>;
