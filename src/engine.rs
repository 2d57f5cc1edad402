//! Protocol engine: login heartbeat, receive loop and command issuance
//! over one shared transport.
//!
//! Three concurrent activities share the bus: the periodic heartbeat, the
//! blocking receive loop and caller-issued commands. All writes funnel
//! through a single writer task via a message-passing channel, so frames
//! never interleave on the wire; the receive loop is the only writer to
//! the [`StatusAccumulator`], and consumers get cloned snapshots over a
//! broadcast channel.
//!
//! Commands are fire-and-forget at the protocol level: the device offers
//! no acknowledgment, so a command returns once the frame is handed to the
//! transport, never once the device applies it.

use crate::login::{LoginScheduler, LoginStatus};
use crate::protocol::{
    Command, Current, Frame, OverVoltage, Setpoints, UnitAddress, Voltage,
};
use crate::status::{StatusAccumulator, StatusReading};
use crate::transport::{FrameSink, FrameSource, TransportError};
use crate::protocol;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// Errors surfaced to callers of the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps [`protocol::AddressError`].
    #[error(transparent)]
    Address(#[from] protocol::AddressError),

    /// Wraps [`protocol::ValidationError`].
    #[error(transparent)]
    Validation(#[from] protocol::ValidationError),

    /// Wraps [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The last heartbeat failed, so the device is ignoring commands.
    #[error("not logged in; the device will not honor commands")]
    NotLoggedIn,

    /// The engine has been stopped.
    #[error("protocol engine stopped")]
    Stopped,
}

const OUTBOUND_QUEUE: usize = 16;
const SNAPSHOT_QUEUE: usize = 64;

/// Backoff after a receive failure so a dead adapter does not spin the
/// receive loop.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

enum Outbound {
    /// Fire-and-forget command frame.
    Command(Frame),
    /// Heartbeat frame; the writer reports the send outcome back so the
    /// scheduler can infer the session state.
    Login {
        frame: Frame,
        done: oneshot::Sender<Result<(), ()>>,
    },
}

/// Orchestrates the Flatpack2 protocol over one transport.
pub struct ProtocolEngine {
    address: UnitAddress,
    setpoints: Mutex<Setpoints>,
    outbound: mpsc::Sender<Outbound>,
    snapshots: broadcast::Sender<StatusReading>,
    login: watch::Receiver<LoginStatus>,
    errors: Option<mpsc::UnboundedReceiver<TransportError>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolEngine {
    /// Starts the engine: spawns the writer task, the login heartbeat and
    /// the receive loop. The first login frame goes out immediately.
    pub fn start<S, R>(sink: S, source: R, address: UnitAddress) -> Self
    where
        S: FrameSink,
        R: FrameSource,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_QUEUE);
        let (login_tx, login_rx) = watch::channel(LoginStatus::LoggingIn);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(write_loop(sink, outbound_rx, error_tx.clone())),
            tokio::spawn(heartbeat_loop(
                LoginScheduler::new(address),
                outbound_tx.clone(),
                login_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(receive_loop(
                source,
                snapshot_tx.clone(),
                error_tx,
                shutdown_rx,
            )),
        ];

        Self {
            address,
            setpoints: Mutex::new(Setpoints::default()),
            outbound: outbound_tx,
            snapshots: snapshot_tx,
            login: login_rx,
            errors: Some(error_rx),
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Sets the live output voltage.
    pub async fn set_voltage(&self, volts: f64) -> Result<(), Error> {
        let voltage = Voltage::try_from(volts)?;
        self.send_command(Command::SetVoltage(voltage)).await
    }

    /// Sets the live current limit.
    pub async fn set_current_limit(&self, amps: f64) -> Result<(), Error> {
        let current = Current::try_from(amps)?;
        self.send_command(Command::SetCurrentLimit(current)).await
    }

    /// Sets the over-voltage protection threshold.
    pub async fn set_over_voltage_protection(&self, volts: f64) -> Result<(), Error> {
        let ovp = OverVoltage::try_from(volts)?;
        self.send_command(Command::SetOverVoltageProtection(ovp))
            .await
    }

    /// Stores a persistent default voltage, applied by the device only
    /// after the next login cycle or power cycle.
    pub async fn store_default_voltage(&self, volts: f64) -> Result<(), Error> {
        let voltage = Voltage::try_from(volts)?;
        self.send_command(Command::StoreDefaultVoltage(voltage))
            .await
    }

    async fn send_command(&self, command: Command) -> Result<(), Error> {
        if *self.login.borrow() == LoginStatus::LoggedOut {
            return Err(Error::NotLoggedIn);
        }
        let frame = {
            let mut setpoints = self.setpoints.lock().await;
            setpoints.encode(command, self.address.unit_id())?
        };
        self.outbound
            .send(Outbound::Command(frame))
            .await
            .map_err(|_| Error::Stopped)
    }

    /// Subscribes to the stream of status snapshots.
    ///
    /// The stream is unbounded and lazy; dropping the receiver and calling
    /// `monitor` again restarts consumption from the next snapshot. A slow
    /// consumer sees [`broadcast::error::RecvError::Lagged`] rather than
    /// stalling the receive loop.
    pub fn monitor(&self) -> broadcast::Receiver<StatusReading> {
        self.snapshots.subscribe()
    }

    /// Current session state as inferred from the heartbeat.
    pub fn login_status(&self) -> LoginStatus {
        *self.login.borrow()
    }

    /// Takes the transport-error channel. Heartbeat and command send
    /// failures land here; the engine keeps running through them.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
        self.errors.take()
    }

    /// Stops the heartbeat and receive loop and releases the transport.
    ///
    /// An in-flight write completes before the writer exits; the blocking
    /// receive wait is cancelled promptly.
    pub async fn stop(self) {
        let ProtocolEngine {
            shutdown,
            outbound,
            tasks,
            ..
        } = self;
        let _ = shutdown.send(true);
        drop(outbound);
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Owns the frame sink; the only task that writes to the transport.
async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    errors: mpsc::UnboundedSender<TransportError>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Command(frame) => {
                if let Err(err) = sink.send(&frame).await {
                    warn!("command send failed: {err}");
                    let _ = errors.send(err);
                }
            }
            Outbound::Login { frame, done } => {
                let result = sink.send(&frame).await;
                let outcome = result.as_ref().map(|_| ()).map_err(|_| ());
                if let Err(err) = result {
                    warn!("login heartbeat send failed: {err}");
                    let _ = errors.send(err);
                }
                let _ = done.send(outcome);
            }
        }
    }
    debug!("writer task ending");
}

/// Drives the login scheduler: sends a heartbeat at every deadline and
/// publishes the inferred session state.
async fn heartbeat_loop(
    mut scheduler: LoginScheduler,
    outbound: mpsc::Sender<Outbound>,
    login: watch::Sender<LoginStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let deadline = scheduler.next_deadline(Instant::now());
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep_until(deadline) => {
                let frame = scheduler.begin_login();
                let _ = login.send(scheduler.status());

                let (done_tx, done_rx) = oneshot::channel();
                if outbound
                    .send(Outbound::Login { frame, done: done_tx })
                    .await
                    .is_err()
                {
                    break;
                }
                match done_rx.await {
                    Ok(Ok(())) => scheduler.mark_sent(Instant::now()),
                    _ => scheduler.mark_failed(Instant::now()),
                }
                let _ = login.send(scheduler.status());
            }
        }
    }
    debug!("heartbeat task ending");
}

/// Owns the frame source and the accumulator; single-writer over the
/// per-unit telemetry state.
async fn receive_loop<R: FrameSource>(
    mut source: R,
    snapshots: broadcast::Sender<StatusReading>,
    errors: mpsc::UnboundedSender<TransportError>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut accumulator = StatusAccumulator::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = source.recv() => match received {
                Ok(Some(frame)) => {
                    match accumulator.ingest(&frame, std::time::Instant::now()) {
                        Some(snapshot) => {
                            // No receivers is fine; monitor() may not be active.
                            let _ = snapshots.send(snapshot);
                        }
                        None => trace!("ignoring bus frame {:08X}", frame.raw_id()),
                    }
                }
                Ok(None) => {
                    debug!("transport closed, receive loop ending");
                    break;
                }
                Err(err) => {
                    warn!("receive failed: {err}");
                    let _ = errors.send(err);
                    sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        }
    }
    debug!("receive task ending");
}
