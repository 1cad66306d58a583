use serde::Serialize;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::gateway::ConnectionState;
use crate::relay::{SharedRelays, CHANNEL_COUNT};
use crate::rtc::ClockSensor;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything a task needs, built once in `main` and cloned into each task.
#[derive(Clone)]
pub(crate) struct AppContext {
    pub(crate) relays: SharedRelays,
    pub(crate) clock: Arc<ClockSensor>,
    pub(crate) connection: watch::Receiver<ConnectionState>,
}

// ---------------------------------------------------------------------------
// JSON response (what the status query returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct StatusSnapshot {
    /// `HH:MM:SS`, from the RTC when readable.
    pub(crate) time: String,
    pub(crate) relays: [bool; CHANNEL_COUNT],
    pub(crate) mqtt_connected: bool,
}

impl AppContext {
    /// Build the status snapshot.
    pub(crate) async fn snapshot(&self) -> StatusSnapshot {
        let clock = Arc::clone(&self.clock);
        let rtc_time = tokio::task::spawn_blocking(move || clock.get_time())
            .await
            .ok()
            .and_then(|r| r.ok());

        let time = match rtc_time {
            Some(reading) => reading.time_string(),
            None => system_time_string(),
        };

        let relays = self.relays.lock().await.states();
        let mqtt_connected = self.connection.borrow().is_connected();

        StatusSnapshot {
            time,
            relays,
            mqtt_connected,
        }
    }
}

/// Local wall-clock time, or UTC when the local offset is unknown.
fn system_time_string() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::relays_with;
    use crate::relay::MockPins;
    use crate::rtc::MockBus;

    fn context(bus: &MockBus) -> AppContext {
        let (_tx, connection) = watch::channel(ConnectionState::Disconnected);
        AppContext {
            relays: relays_with(&MockPins::default()),
            clock: Arc::new(ClockSensor::with_bus(Box::new(bus.clone())).unwrap()),
            connection,
        }
    }

    #[tokio::test]
    async fn snapshot_uses_rtc_time_and_relay_states() {
        let bus = MockBus::default();
        bus.load(0x00, &[0x05, 0x04, 0x13, 0x01, 0x01, 0x01, 0x26]);
        let ctx = context(&bus);
        ctx.relays.lock().await.set(1, true);

        let snap = ctx.snapshot().await;
        assert_eq!(snap.time, "13:04:05");
        assert_eq!(snap.relays, [false, true, false]);
        assert!(!snap.mqtt_connected);
    }

    #[tokio::test]
    async fn snapshot_falls_back_to_system_time() {
        let bus = MockBus::default();
        let ctx = context(&bus);
        bus.fail_reads_at(0x00, true);

        let snap = ctx.snapshot().await;
        assert_eq!(snap.time.len(), 8);
        assert_eq!(snap.time.matches(':').count(), 2);
    }

    #[test]
    fn snapshot_serializes_relays_as_array() {
        let snap = StatusSnapshot {
            time: "09:00:00".into(),
            relays: [true, false, true],
            mqtt_connected: true,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["relays"], serde_json::json!([true, false, true]));
        assert_eq!(json["time"], "09:00:00");
    }
}
