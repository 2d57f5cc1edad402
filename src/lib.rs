//! A library for controlling Eltek Flatpack2 rectifiers over CAN.
//!
//! The Flatpack2 is a telecom DC rectifier that sits on a shared 125 kbps
//! CAN bus. It broadcasts telemetry (voltage, current, temperature) as
//! separate frames and accepts live configuration (output voltage, current
//! limit, over-voltage protection) only while periodic login frames keep
//! its session alive. This crate implements that protocol in three layers:
//!
//! 1. **Wire protocol** ([`protocol`]): validated value types, identifier
//!    encode/decode, command-frame construction and telemetry decoding.
//!    Pure functions, no I/O.
//! 2. **Transport** ([`transport`], [`slcan`]): the frame-level boundary
//!    the engine consumes, plus an implementation for serial SLCAN
//!    adapters.
//! 3. **Engine** ([`engine`]): an async orchestrator that drives the login
//!    heartbeat, merges broadcast telemetry into status snapshots
//!    ([`status`]) and serializes command sends onto the shared bus.
//!
//! ## Quick Start
//!
//! ```no_run
//! use flatpack2_lib::{
//!     engine::ProtocolEngine,
//!     protocol::{SerialNumber, UnitAddress, UnitId},
//!     slcan,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let address = UnitAddress::new(
//!     UnitId::try_from(1)?,
//!     SerialNumber::try_from("134372105069")?,
//! );
//!
//! let (sink, source) = slcan::open("/dev/ttyUSB0").await?;
//! let engine = ProtocolEngine::start(sink, source, address);
//!
//! engine.set_voltage(48.0).await?;
//!
//! let mut monitor = engine.monitor();
//! while let Ok(reading) = monitor.recv().await {
//!     println!("{reading}");
//! }
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Note that the protocol offers no command acknowledgment: a successful
//! command call means the frame was handed to the transport, not that the
//! device applied it. Watch the telemetry stream to observe the effect.

pub mod engine;
pub mod login;
pub mod protocol;
pub mod slcan;
pub mod status;
pub mod transport;
