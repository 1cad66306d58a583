//! TOML config file loading, environment overrides, and validation for the
//! broker session, topics, RTC bus and relay wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::relay::CHANNEL_COUNT;
use crate::rtc::BusConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub topics: Topics,
    pub rtc: BusConfig,
    pub web: WebConfig,
    pub relays: Vec<RelayEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connect over TLS using the platform root certificates.
    pub tls: bool,
    /// Client id is `<prefix>-<8 random hex digits>`.
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    /// Inbound relay commands.
    pub command: String,
    /// Relay status and the online announcement.
    pub status: String,
    /// Periodic temperature + time.
    pub telemetry: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub index: usize,
    pub gpio_pin: i64,
    #[serde(default = "default_active_high")]
    pub active_high: bool,
}

fn default_active_high() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            topics: Topics::default(),
            rtc: BusConfig::default(),
            web: WebConfig::default(),
            relays: [17, 27, 22]
                .into_iter()
                .enumerate()
                .map(|(index, gpio_pin)| RelayEntry {
                    index,
                    gpio_pin,
                    active_high: true,
                })
                .collect(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            client_id_prefix: "relay-node".to_string(),
            keep_alive_secs: 60,
            reconnect_delay_secs: 5,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "home/relay-node/relay".to_string(),
            status: "home/relay-node/status".to_string(),
            telemetry: "home/relay-node/sensor".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_rtc(&mut errors);
        self.validate_relays(&mut errors);

        if self.web.enabled && self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.client_id_prefix.trim().is_empty() {
            errors.push("mqtt: client_id_prefix is empty".to_string());
        }
        if m.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt: keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                m.keep_alive_secs
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt: password given without username".to_string());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        for (name, topic) in [
            ("command", &t.command),
            ("status", &t.status),
            ("telemetry", &t.telemetry),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("topics: {name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("topics: {name} '{topic}' must not contain wildcards"));
            }
        }
        if t.command == t.status || t.command == t.telemetry {
            errors.push(format!(
                "topics: command topic '{}' must differ from the publish topics",
                t.command
            ));
        }
    }

    fn validate_rtc(&self, errors: &mut Vec<String>) {
        if self.rtc.address > 0x7F {
            errors.push(format!(
                "rtc: address 0x{:x} is not a 7-bit I2C address",
                self.rtc.address
            ));
        }
        if self.rtc.clock_hz == 0 {
            errors.push("rtc: clock_hz must be positive".to_string());
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen_idx: HashSet<usize> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, r) in self.relays.iter().enumerate() {
            if r.index >= CHANNEL_COUNT {
                errors.push(format!(
                    "relays[{i}]: index {} out of range (0-{})",
                    r.index,
                    CHANNEL_COUNT - 1
                ));
            } else if !seen_idx.insert(r.index) {
                errors.push(format!("relays[{i}]: duplicate index {}", r.index));
            }

            if !VALID_GPIO_PINS.contains(&r.gpio_pin) {
                errors.push(format!(
                    "relays[{i}]: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    r.gpio_pin
                ));
            } else if !seen_pins.insert(r.gpio_pin) {
                errors.push(format!(
                    "relays[{i}]: gpio_pin {} is already used by another relay",
                    r.gpio_pin
                ));
            }
        }
    }

    /// Apply environment overrides. `var` looks up a variable by name.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port:?}"))?;
        }
        if let Some(user) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(pass);
        }
        if let Some(port) = var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port:?}"))?;
        }
        // Many relay boards are active-low; flip every channel at once.
        if let Some(v) = var("RELAY_ACTIVE_LOW") {
            let active_low = v == "1" || v.eq_ignore_ascii_case("true");
            for r in &mut self.relays {
                r.active_high = !active_low;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file (defaults if it does not exist), apply
/// environment overrides, and validate the result.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_overrides(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        broker = %format_args!("{}:{}", config.mqtt.host, config.mqtt.port),
        relays = config.relays.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
