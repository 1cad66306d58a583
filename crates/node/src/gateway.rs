//! MQTT gateway: broker connection state, relay command ingestion, and
//! status/telemetry publishing.
//!
//! ## Connection state machine
//!
//! ```text
//! Disconnected ──[ConnAck]──▶ Connected ──[Disconnect / transport error]──▶ Disconnected
//!                              │
//!                              └─ on entry: subscribe command topic, publish {"online":true}
//! ```
//!
//! Everything the gateway publishes is dropped while disconnected; nothing is
//! queued for later.

use rumqttc::{AsyncClient, ConnectionError, Event, Packet, QoS};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command::parse_relay_command;
use crate::config::Topics;
use crate::relay::{SharedRelays, CHANNEL_COUNT};
use crate::rtc::ClockReading;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub(crate) fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Transition function. `None` means the event leaves the state as is.
    pub(crate) fn on_event(self, event: &BrokerEvent) -> Option<Self> {
        match (self, event) {
            (Self::Disconnected, BrokerEvent::Connected) => Some(Self::Connected),
            (Self::Connected, BrokerEvent::Disconnected) => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// What the transport reports to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerEvent {
    Connected,
    Disconnected,
    Error(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Translate one rumqttc event-loop poll into gateway events.
///
/// A transport error means the session is gone, so it is reported as a
/// disconnect followed by the error itself.
pub(crate) fn broker_events(polled: Result<Event, ConnectionError>) -> Vec<BrokerEvent> {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(_))) => vec![BrokerEvent::Connected],
        Ok(Event::Incoming(Packet::Disconnect)) => vec![BrokerEvent::Disconnected],
        Ok(Event::Incoming(Packet::Publish(p))) => vec![BrokerEvent::Message {
            topic: p.topic,
            payload: p.payload.to_vec(),
        }],
        Ok(_) => vec![],
        Err(ConnectionError::ConnectionRefused(code)) => vec![
            BrokerEvent::Disconnected,
            BrokerEvent::Error(format!("connection refused: {code:?}")),
        ],
        Err(e) => vec![BrokerEvent::Disconnected, BrokerEvent::Error(e.to_string())],
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct StatusMsg {
    pub(crate) relay: usize,
    pub(crate) state: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct OnlineMsg {
    pub(crate) online: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct TelemetryMsg {
    /// Degrees Celsius, one decimal place. Quarter-degree ties round to
    /// even, like `printf("%.1f")`.
    pub(crate) temperature: f64,
    pub(crate) year: u16,
    pub(crate) month: u8,
    pub(crate) date: u8,
    pub(crate) day: u8,
    pub(crate) hours: u8,
    pub(crate) minutes: u8,
    pub(crate) seconds: u8,
}

impl TelemetryMsg {
    pub(crate) fn new(temperature: f32, t: &ClockReading) -> Self {
        Self {
            temperature: (f64::from(temperature) * 10.0).round_ties_even() / 10.0,
            year: t.year,
            month: t.month,
            date: t.date,
            day: t.day,
            hours: t.hours,
            minutes: t.minutes,
            seconds: t.seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Non-blocking MQTT client operations used by the gateway.
pub(crate) trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
    fn subscribe(&self, topic: &str) -> anyhow::Result<()>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub(crate) struct MessageGateway<P> {
    publisher: P,
    topics: Topics,
    relays: SharedRelays,
    state: watch::Sender<ConnectionState>,
}

impl<P: Publisher> MessageGateway<P> {
    pub(crate) fn new(publisher: P, topics: Topics, relays: SharedRelays) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            publisher,
            topics,
            relays,
            state,
        }
    }

    /// Read-only view of the connection state for other tasks.
    pub(crate) fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) async fn handle_event(&self, event: BrokerEvent) {
        if let Some(next) = self.state().on_event(&event) {
            self.state.send_replace(next);
            info!(state = ?next, "mqtt connection state changed");
        }

        match event {
            // Also on a repeated ConnAck: a new broker session needs the
            // subscription again.
            BrokerEvent::Connected => self.on_connected(),
            BrokerEvent::Disconnected => warn!("mqtt disconnected, transport will reconnect"),
            BrokerEvent::Error(reason) => error!(%reason, "mqtt error"),
            BrokerEvent::Message { topic, payload } => self.handle_message(&topic, &payload).await,
        }
    }

    fn on_connected(&self) {
        match self.publisher.subscribe(&self.topics.command) {
            Ok(()) => info!(topic = %self.topics.command, "subscribed to command topic"),
            Err(e) => error!(topic = %self.topics.command, "subscribe failed: {e:#}"),
        }
        self.publish_online();
    }

    /// Apply a relay command. Anything that does not name a valid channel is
    /// dropped without a reply.
    pub(crate) async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if !self.state().is_connected() {
            debug!(%topic, "message while disconnected, ignored");
            return;
        }
        if topic != self.topics.command {
            debug!(%topic, "unhandled topic");
            return;
        }

        let cmd = parse_relay_command(payload);
        let Some(relay) = cmd.channel(CHANNEL_COUNT) else {
            warn!(
                relay = ?cmd.relay,
                payload = %String::from_utf8_lossy(payload),
                "invalid relay index, command dropped"
            );
            return;
        };

        self.relays.lock().await.set(relay, cmd.state);
        info!(relay, on = cmd.state, "relay command applied");
        self.publish_status(relay, cmd.state);
    }

    pub(crate) fn publish_status(&self, relay: usize, state: bool) -> bool {
        self.publish_json(&self.topics.status, &StatusMsg { relay, state })
    }

    pub(crate) fn publish_online(&self) -> bool {
        self.publish_json(&self.topics.status, &OnlineMsg { online: true })
    }

    pub(crate) fn publish_telemetry(&self, temperature: f32, reading: &ClockReading) -> bool {
        self.publish_json(
            &self.topics.telemetry,
            &TelemetryMsg::new(temperature, reading),
        )
    }

    /// Returns whether the message was handed to the client.
    fn publish_json<T: Serialize>(&self, topic: &str, msg: &T) -> bool {
        if !self.state().is_connected() {
            debug!(%topic, "not connected, publish dropped");
            return false;
        }
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                error!(%topic, "failed to encode payload: {e}");
                return false;
            }
        };

        match self.publisher.publish(topic, payload) {
            Ok(()) => {
                debug!(%topic, "published");
                true
            }
            Err(e) => {
                warn!(%topic, "publish failed: {e:#}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
