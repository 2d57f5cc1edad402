//! Integration tests for the protocol engine over an in-memory transport.
//!
//! The mock transport substitutes tokio channels for the SLCAN adapter:
//! frames the engine writes land in `wire`, frames pushed into `inbound`
//! reach the receive loop. Timing tests run under a paused tokio clock.

use assert_matches::assert_matches;
use flatpack2_lib::engine::{Error, ProtocolEngine};
use flatpack2_lib::login::{LoginStatus, LOGIN_INTERVAL};
use flatpack2_lib::protocol::{
    decode_id, encode_id, Frame, MessageClass, SerialNumber, UnitAddress, UnitId,
};
use flatpack2_lib::transport::{FrameSink, FrameSource, TransportError};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct ChannelSink(mpsc::UnboundedSender<Frame>);

impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.0.send(frame.clone()).map_err(|_| {
            TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        })
    }
}

/// A transport whose send half is permanently broken.
struct FailingSink;

impl FrameSink for FailingSink {
    async fn send(&mut self, _frame: &Frame) -> Result<(), TransportError> {
        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "adapter unplugged",
        )))
    }
}

struct ChannelSource(mpsc::UnboundedReceiver<Frame>);

impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.0.recv().await)
    }
}

fn unit(id: u8) -> UnitId {
    UnitId::try_from(id).unwrap()
}

fn address() -> UnitAddress {
    UnitAddress::new(unit(1), SerialNumber::try_from("134372105069").unwrap())
}

fn telemetry(class: MessageClass, unit_id: u8, data: &[u8]) -> Frame {
    Frame::new(encode_id(class, unit(unit_id)), data.to_vec()).unwrap()
}

/// Engine over in-memory channels: (engine, frames it wrote, inbound feed).
fn harness() -> (
    ProtocolEngine,
    mpsc::UnboundedReceiver<Frame>,
    mpsc::UnboundedSender<Frame>,
) {
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let engine = ProtocolEngine::start(ChannelSink(wire_tx), ChannelSource(inbound_rx), address());
    (engine, wire_rx, inbound_tx)
}

#[tokio::test(start_paused = true)]
async fn heartbeat_sends_one_login_per_interval() {
    let (engine, mut wire, _inbound) = harness();
    let start = Instant::now();

    let mut times = Vec::new();
    for _ in 0..4 {
        let frame = wire.recv().await.unwrap();
        assert_eq!(decode_id(frame.id()), Some((MessageClass::Login, unit(1))));
        assert_eq!(
            frame.data(),
            &[0x13, 0x43, 0x72, 0x10, 0x50, 0x69, 0x00, 0x00]
        );
        times.push(Instant::now());
    }

    // First login goes out immediately, then exactly one per interval:
    // no skipped cycles and no doubled sends.
    assert_eq!(times[0], start);
    for pair in times.windows(2) {
        assert_eq!(pair[1] - pair[0], LOGIN_INTERVAL);
    }

    engine.stop().await;
}

#[tokio::test]
async fn monitor_merges_partial_telemetry() {
    let (engine, mut _wire, inbound) = harness();
    let mut monitor = engine.monitor();

    // 48.0 V arrives alone.
    inbound
        .send(telemetry(MessageClass::TelemetryVoltage, 1, &[0xC0, 0x12]))
        .unwrap();
    let first = monitor.recv().await.unwrap();
    assert_eq!(first.voltage().unwrap().value, 48.0);
    assert_eq!(first.current(), None);

    // 12.3 A arrives later; the voltage must carry over unchanged.
    inbound
        .send(telemetry(MessageClass::TelemetryCurrent, 1, &[0x7B, 0x00]))
        .unwrap();
    let second = monitor.recv().await.unwrap();
    assert_eq!(second.voltage().unwrap().value, 48.0);
    assert_eq!(second.current().unwrap().value, 12.3);

    engine.stop().await;
}

#[tokio::test]
async fn foreign_frames_do_not_disturb_other_units() {
    let (engine, mut _wire, inbound) = harness();
    let mut monitor = engine.monitor();

    // Bus noise with an identifier outside the protocol: no snapshot.
    inbound
        .send(Frame::new(embedded_can::ExtendedId::new(0x0066_0000).unwrap(), vec![1, 2, 3]).unwrap())
        .unwrap();
    // Telemetry for another unit: snapshot for that unit only.
    inbound
        .send(telemetry(MessageClass::TelemetryVoltage, 2, &[0x00, 0x10]))
        .unwrap();
    // Then our unit reports current, with no voltage seen yet.
    inbound
        .send(telemetry(MessageClass::TelemetryCurrent, 1, &[0x7B, 0x00]))
        .unwrap();

    let other = monitor.recv().await.unwrap();
    assert_eq!(other.unit_id(), unit(2));

    let mine = monitor.recv().await.unwrap();
    assert_eq!(mine.unit_id(), unit(1));
    assert_eq!(mine.voltage(), None, "unit 2 voltage must not leak into unit 1");
    assert_eq!(mine.current().unwrap().value, 12.3);

    engine.stop().await;
}

#[tokio::test]
async fn commands_are_validated_and_serialized() {
    let (engine, mut wire, _inbound) = harness();

    // The initial login precedes any command on the wire.
    let first = wire.recv().await.unwrap();
    assert_eq!(decode_id(first.id()), Some((MessageClass::Login, unit(1))));

    engine.set_voltage(48.0).await.unwrap();
    let control = wire.recv().await.unwrap();
    assert_eq!(decode_id(control.id()), Some((MessageClass::Control, unit(1))));
    // Factory current limit 40.0 A and OVP 59.5 V travel along.
    assert_eq!(
        control.data(),
        &[0x90, 0x01, 0xC0, 0x12, 0xC0, 0x12, 0x3E, 0x17]
    );

    engine.store_default_voltage(48.0).await.unwrap();
    let stored = wire.recv().await.unwrap();
    assert_eq!(
        decode_id(stored.id()),
        Some((MessageClass::StoreDefaults, unit(1)))
    );
    assert_eq!(stored.data(), &[0x29, 0x15, 0x00, 0xC0, 0x12]);
    assert_ne!(stored.raw_id(), control.raw_id());

    assert_matches!(engine.set_voltage(43.49).await, Err(Error::Validation(_)));
    assert_matches!(engine.set_voltage(57.41).await, Err(Error::Validation(_)));
    assert_matches!(
        engine.set_current_limit(41.8).await,
        Err(Error::Validation(_))
    );
    engine.set_current_limit(41.7).await.unwrap();
    engine.set_current_limit(0.0).await.unwrap();

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_failure_logs_out_gates_commands_and_retries() {
    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut engine = ProtocolEngine::start(FailingSink, ChannelSource(inbound_rx), address());
    let mut errors = engine.take_errors().unwrap();

    // The failed heartbeat lands on the error channel.
    assert_matches!(errors.recv().await, Some(TransportError::Io(_)));

    // Give the heartbeat task a chance to record the outcome.
    for _ in 0..50 {
        if engine.login_status() == LoginStatus::LoggedOut {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(engine.login_status(), LoginStatus::LoggedOut);

    // Logged out: the device would ignore commands, so the engine refuses.
    assert_matches!(engine.set_voltage(48.0).await, Err(Error::NotLoggedIn));

    // The scheduler keeps retrying on the next tick rather than stopping.
    assert_matches!(errors.recv().await, Some(TransportError::Io(_)));

    engine.stop().await;
}

#[tokio::test]
async fn stop_terminates_promptly_and_releases_the_transport() {
    let (engine, mut wire, inbound) = harness();
    let _ = wire.recv().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), engine.stop())
        .await
        .expect("stop should join all engine tasks");

    // The writer released the sink, so the wire channel is closed.
    assert!(wire.recv().await.is_none());
    drop(inbound);
}
