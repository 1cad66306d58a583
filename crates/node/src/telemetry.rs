//! Periodic telemetry: samples the RTC once per second and publishes
//! temperature + time through the gateway while connected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::gateway::{MessageGateway, Publisher};
use crate::rtc::ClockSensor;

pub(crate) const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Published,
    /// Both reads succeeded but the gateway dropped the message.
    Dropped,
    SensorFailed,
}

/// Run the telemetry loop. Intended to be `tokio::spawn`-ed from main.
///
/// Nothing is sampled until the gateway first reports `Connected`; after
/// that every tick samples regardless of connection state. Returns when
/// `shutdown` becomes `true`.
pub(crate) async fn run<P: Publisher>(
    clock: Arc<ClockSensor>,
    gateway: Arc<MessageGateway<P>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connection = gateway.connection();
    let connected = tokio::select! {
        res = async { connection.wait_for(|s| s.is_connected()).await.map(|_| ()) } => res.is_ok(),
        _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => false,
    };
    if !connected {
        info!("telemetry stopped before first connection");
        return;
    }

    let mut ticker = tokio::time::interval(TELEMETRY_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = TELEMETRY_PERIOD.as_millis() as u64, "telemetry started");

    loop {
        // Only pick the branch here; the watch guard must not live across
        // the tick's await.
        tokio::select! {
            _ = ticker.tick() => {}
            _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => break,
        }
        tick(&clock, &gateway).await;
    }
    info!("telemetry stopped");
}

/// Sample temperature and time once and publish them. A failed read skips
/// the tick; the next tick starts from scratch.
pub(crate) async fn tick<P: Publisher>(
    clock: &Arc<ClockSensor>,
    gateway: &MessageGateway<P>,
) -> TickOutcome {
    let sensor = Arc::clone(clock);
    let sampled =
        tokio::task::spawn_blocking(move || (sensor.get_temperature(), sensor.get_time())).await;

    let (temperature, reading) = match sampled {
        Ok((Ok(temperature), Ok(reading))) => (temperature, reading),
        Ok((temperature, reading)) => {
            if let Err(e) = temperature {
                error!("telemetry skipped, temperature read failed: {e}");
            }
            if let Err(e) = reading {
                error!("telemetry skipped, time read failed: {e}");
            }
            return TickOutcome::SensorFailed;
        }
        Err(e) => {
            error!("telemetry skipped, sampling task failed: {e}");
            return TickOutcome::SensorFailed;
        }
    };

    if gateway.publish_telemetry(temperature, &reading) {
        TickOutcome::Published
    } else {
        TickOutcome::Dropped
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topics;
    use crate::gateway::tests::{gateway, RecordingPublisher};
    use crate::gateway::BrokerEvent;
    use crate::rtc::MockBus;

    /// RTC holding 2026-02-11 09:52:30 (Tuesday) at 25.25 °C.
    fn rtc() -> (Arc<ClockSensor>, MockBus) {
        let bus = MockBus::default();
        bus.load(0x00, &[0x30, 0x52, 0x09, 0x03, 0x11, 0x02, 0x26]);
        bus.load(0x11, &[0x19, 0x40]);
        let clock = ClockSensor::with_bus(Box::new(bus.clone())).unwrap();
        (Arc::new(clock), bus)
    }

    fn telemetry(publisher: &RecordingPublisher) -> Vec<String> {
        publisher.on_topic(&Topics::default().telemetry)
    }

    #[tokio::test]
    async fn tick_publishes_while_connected() {
        let (clock, _) = rtc();
        let (gw, publisher, _) = gateway();
        gw.handle_event(BrokerEvent::Connected).await;

        assert_eq!(tick(&clock, &gw).await, TickOutcome::Published);
        assert_eq!(
            telemetry(&publisher),
            vec![
                r#"{"temperature":25.2,"year":2026,"month":2,"date":11,"day":3,"hours":9,"minutes":52,"seconds":30}"#
            ]
        );
    }

    #[tokio::test]
    async fn temperature_failure_suppresses_tick_and_next_tick_recovers() {
        let (clock, bus) = rtc();
        let (gw, publisher, _) = gateway();
        gw.handle_event(BrokerEvent::Connected).await;

        bus.fail_reads_at(0x11, true);
        assert_eq!(tick(&clock, &gw).await, TickOutcome::SensorFailed);
        assert!(telemetry(&publisher).is_empty());

        bus.fail_reads_at(0x11, false);
        assert_eq!(tick(&clock, &gw).await, TickOutcome::Published);
        assert_eq!(telemetry(&publisher).len(), 1);
    }

    #[tokio::test]
    async fn time_failure_suppresses_tick() {
        let (clock, bus) = rtc();
        let (gw, publisher, _) = gateway();
        gw.handle_event(BrokerEvent::Connected).await;

        bus.fail_reads_at(0x00, true);
        assert_eq!(tick(&clock, &gw).await, TickOutcome::SensorFailed);
        assert!(telemetry(&publisher).is_empty());
    }

    #[tokio::test]
    async fn tick_while_disconnected_is_dropped() {
        let (clock, _) = rtc();
        let (gw, publisher, _) = gateway();
        gw.handle_event(BrokerEvent::Connected).await;
        gw.handle_event(BrokerEvent::Disconnected).await;

        assert_eq!(tick(&clock, &gw).await, TickOutcome::Dropped);
        assert!(telemetry(&publisher).is_empty());
    }

    #[tokio::test]
    async fn tick_publishes_again_after_reconnect() {
        let (clock, _) = rtc();
        let (gw, publisher, _) = gateway();
        gw.handle_event(BrokerEvent::Connected).await;
        assert_eq!(tick(&clock, &gw).await, TickOutcome::Published);

        gw.handle_event(BrokerEvent::Disconnected).await;
        assert_eq!(tick(&clock, &gw).await, TickOutcome::Dropped);

        gw.handle_event(BrokerEvent::Connected).await;
        assert_eq!(tick(&clock, &gw).await, TickOutcome::Published);
        assert_eq!(telemetry(&publisher).len(), 2);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_before_connecting() {
        let (clock, _) = rtc();
        let (gw, publisher, _) = gateway();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run(clock, Arc::new(gw), stop_rx));
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("telemetry loop did not stop")
            .unwrap();
        assert_eq!(publisher.count(), 0);
    }

    #[tokio::test]
    async fn run_publishes_every_second_once_connected() {
        let (clock, _) = rtc();
        let (gw, publisher, _) = gateway();
        let gw = Arc::new(gw);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run(clock, Arc::clone(&gw), stop_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(telemetry(&publisher).is_empty(), "sampled before connecting");

        gw.handle_event(BrokerEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let sent = telemetry(&publisher).len();
        assert!((2..=4).contains(&sent), "expected ~3 telemetry messages, got {sent}");
    }
}
