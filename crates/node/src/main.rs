mod command;
mod config;
mod error;
mod gateway;
mod relay;
mod rtc;
mod state;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, Transport};
use std::{env, future::Future, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use config::{MqttConfig, RelayEntry};
use gateway::{broker_events, MessageGateway};
use relay::{open_pins, ActuatorBank, OutputPins};
use rtc::{ClockReading, ClockSensor};
use state::AppContext;

/// Capacity of the rumqttc request channel between client and event loop.
const MQTT_CHANNEL_CAPACITY: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "relay-node.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Relays ──────────────────────────────────────────────────────
    let relays = Arc::new(tokio::sync::Mutex::new(build_relays(open_pins()?, &cfg.relays)));

    // ── RTC ─────────────────────────────────────────────────────────
    let clock = Arc::new(ClockSensor::init(&cfg.rtc).context("rtc init failed")?);
    if cfg.rtc.set_from_system {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        if let Err(e) = clock.set_time(&ClockReading::from_datetime(now)) {
            tracing::warn!("could not seed rtc from system clock: {e}");
        }
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cfg.mqtt), MQTT_CHANNEL_CAPACITY);
    let gateway = Arc::new(MessageGateway::new(
        client,
        cfg.topics.clone(),
        Arc::clone(&relays),
    ));

    // ── Background tasks ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telemetry_task = tokio::spawn(telemetry::run(
        Arc::clone(&clock),
        Arc::clone(&gateway),
        shutdown_rx.clone(),
    ));

    let web_task = cfg.web.enabled.then(|| {
        let ctx = AppContext {
            relays: Arc::clone(&relays),
            clock: Arc::clone(&clock),
            connection: gateway.connection(),
        };
        let port = cfg.web.port;
        let stop = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(ctx, port, stop).await {
                tracing::error!("status api stopped: {e:#}");
            }
        })
    });

    // ── Event loop ──────────────────────────────────────────────────
    let reconnect_delay = Duration::from_secs(cfg.mqtt.reconnect_delay_secs);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = &mut shutdown => break,
        };
        let failed = polled.is_err();
        for event in broker_events(polled) {
            gateway.handle_event(event).await;
        }
        if failed && reconnect_backoff(reconnect_delay, &mut shutdown).await {
            break;
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = telemetry_task.await {
        tracing::error!("telemetry task failed: {e}");
    }
    if let Some(task) = web_task {
        if let Err(e) = task.await {
            tracing::error!("status api task failed: {e}");
        }
    }

    relays.lock().await.all_off();
    if let Err(e) = clock.deinit() {
        tracing::warn!("rtc deinit failed: {e}");
    }
    Ok(())
}

/// Build the relay bank from the config entries. Every configured channel
/// starts OFF.
fn build_relays(pins: Box<dyn OutputPins>, entries: &[RelayEntry]) -> ActuatorBank {
    let mut bank = ActuatorBank::new(pins);
    for entry in entries {
        match u8::try_from(entry.gpio_pin) {
            Ok(pin) => bank.init(entry.index, pin, entry.active_high),
            Err(_) => tracing::error!(relay = entry.index, pin = entry.gpio_pin, "gpio pin out of range"),
        }
    }
    bank
}

/// Unique per boot so two nodes with the same prefix never kick each other
/// off the broker.
fn client_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", fastrand::u32(..))
}

fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let id = client_id(&cfg.client_id_prefix);
    tracing::info!(client_id = %id, host = %cfg.host, port = cfg.port, "mqtt client configured");

    let mut opts = MqttOptions::new(id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    if let Some(username) = &cfg.username {
        opts.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    if cfg.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

/// Wait out the reconnect delay. Returns `true` when `shutdown` fires first.
async fn reconnect_backoff<F>(delay: Duration, shutdown: &mut F) -> bool
where
    F: Future<Output = ()> + Unpin,
{
    tokio::select! {
        _ = sleep(delay) => false,
        _ = shutdown => true,
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("sigterm handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl-c received"),
        _ = terminate => tracing::info!("sigterm received"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
