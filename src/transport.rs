//! Transport boundary consumed by the protocol engine.
//!
//! The engine only ever sees two capabilities: putting one [`Frame`] on the
//! bus and taking the next inbound [`Frame`] off it. Anything below that
//! (serial adapters, line codecs, bus arbitration) lives behind these
//! traits; [`crate::slcan`] provides the implementation for serial SLCAN
//! adapters, and the integration tests substitute in-memory channels.

use crate::protocol::Frame;
use std::future::Future;

/// Errors surfaced by a transport implementation.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Underlying device I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failed to open or configure the serial port.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// The adapter produced a line that does not parse as a CAN frame.
    #[error("malformed adapter line: {0:?}")]
    MalformedLine(String),
}

/// Write half of a transport. Sends one frame at a time; the engine's
/// writer task serializes all callers onto this.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: &Frame)
        -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read half of a transport.
///
/// `recv` resolves with `Ok(None)` once the transport is closed and will
/// not return frames afterwards. Cancellation-safe: the engine drops the
/// pending future on shutdown.
pub trait FrameSource: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;
}
