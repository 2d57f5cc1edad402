//! Telemetry accumulation into per-unit status snapshots.
//!
//! Voltage, current and temperature arrive as separate broadcast frames on
//! the shared bus. [`StatusAccumulator`] is the single writer that merges
//! them into one [`StatusReading`] per unit; consumers only ever see cloned
//! snapshots, never the live record.

use crate::protocol::{decode_id, decode_telemetry, Frame, Telemetry, UnitId};
use std::collections::HashMap;
use std::time::Instant;

/// One telemetry field together with the time it last refreshed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<T> {
    pub value: T,
    pub updated: Instant,
}

/// Accumulated status of one unit.
///
/// Fields start unknown and fill in as their frames arrive; once populated
/// a field is only ever overwritten with a fresher value, never cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReading {
    unit_id: UnitId,
    voltage: Option<Sample<f64>>,
    current: Option<Sample<f64>>,
    temperature: Option<Sample<u8>>,
}

impl StatusReading {
    fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            voltage: None,
            current: None,
            temperature: None,
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Output voltage in volts, if a voltage frame has been seen.
    pub fn voltage(&self) -> Option<Sample<f64>> {
        self.voltage
    }

    /// Output current in amperes, if a current frame has been seen.
    pub fn current(&self) -> Option<Sample<f64>> {
        self.current
    }

    /// Intake temperature in degrees Celsius, if a temperature frame has
    /// been seen.
    pub fn temperature(&self) -> Option<Sample<u8>> {
        self.temperature
    }

    /// True once all three quantities have been observed.
    pub fn is_complete(&self) -> bool {
        self.voltage.is_some() && self.current.is_some() && self.temperature.is_some()
    }
}

impl std::fmt::Display for StatusReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit {}: ", self.unit_id)?;
        match self.voltage {
            Some(sample) => write!(f, "{:.2} V", sample.value)?,
            None => write!(f, "-.-- V")?,
        }
        match self.current {
            Some(sample) => write!(f, " {:.1} A", sample.value)?,
            None => write!(f, " -.- A")?,
        }
        match self.temperature {
            Some(sample) => write!(f, " {} °C", sample.value),
            None => write!(f, " -- °C"),
        }
    }
}

/// Merges partial telemetry frames into per-unit status records.
#[derive(Debug, Default)]
pub struct StatusAccumulator {
    readings: HashMap<UnitId, StatusReading>,
}

impl StatusAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one inbound frame into the matching unit's record.
    ///
    /// Returns a snapshot of the unit's full record after every accepted
    /// update, so callers observe each incremental refresh. Frames that do
    /// not decode to a telemetry class, or whose payload width does not
    /// match their class, are bus noise and yield `None`.
    pub fn ingest(&mut self, frame: &Frame, now: Instant) -> Option<StatusReading> {
        let (class, unit) = decode_id(frame.id())?;
        let telemetry = decode_telemetry(class, frame.data())?;
        let reading = self
            .readings
            .entry(unit)
            .or_insert_with(|| StatusReading::new(unit));
        match telemetry {
            Telemetry::Voltage(volts) => {
                reading.voltage = Some(Sample {
                    value: volts,
                    updated: now,
                })
            }
            Telemetry::Current(amps) => {
                reading.current = Some(Sample {
                    value: amps,
                    updated: now,
                })
            }
            Telemetry::Temperature(celsius) => {
                reading.temperature = Some(Sample {
                    value: celsius,
                    updated: now,
                })
            }
        }
        Some(reading.clone())
    }

    /// Snapshot of one unit's record, if any telemetry has arrived for it.
    pub fn snapshot(&self, unit: UnitId) -> Option<StatusReading> {
        self.readings.get(&unit).cloned()
    }
}
