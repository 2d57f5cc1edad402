//! Wire-level protocol for the Eltek Flatpack2 rectifier.
//!
//! This module contains the fixed constant table for the Flatpack2 CAN
//! protocol (29-bit extended identifiers, fixed-point payload scaling), the
//! validated value types used throughout the crate, and the pure
//! encode/decode functions that turn commands into [`Frame`]s and telemetry
//! frames back into physical quantities.
//!
//! Nothing in here performs I/O; the [`crate::engine`] module drives these
//! functions over a transport.

use embedded_can::ExtendedId;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Smallest addressable unit id on the bus.
pub const UNIT_ID_MIN: u8 = 1;
/// Largest addressable unit id on the bus.
pub const UNIT_ID_MAX: u8 = 63;

/// Number of decimal digits in a Flatpack2 serial number.
pub const SERIAL_DIGITS: usize = 12;

/// Minimum commandable output voltage in volts.
pub const VOLTAGE_MIN: f64 = 43.5;
/// Maximum commandable output voltage in volts.
pub const VOLTAGE_MAX: f64 = 57.4;
/// Output voltage resolution in volts.
pub const VOLTAGE_RESOLUTION: f64 = 0.01;

/// Maximum commandable current limit in amperes.
pub const CURRENT_MAX: f64 = 41.7;
/// Current limit resolution in amperes.
pub const CURRENT_RESOLUTION: f64 = 0.1;

/// Maximum over-voltage protection threshold in volts.
pub const OVER_VOLTAGE_MAX: f64 = 59.5;

/// Maximum CAN payload length.
pub const MAX_PAYLOAD_LEN: usize = 8;

const LOGIN_ID_BASE: u32 = 0x0500_4800;
const CONTROL_ID_BASE: u32 = 0x05FF_4000;
const TELEMETRY_ID_BASE: u32 = 0x0501_4000;
const DEFAULTS_ID_BASE: u32 = 0x0500_0000;
const DEFAULTS_ID_SUFFIX: u32 = 0x9C00;

// Opcode prefix of the store-default-voltage payload.
const DEFAULT_VOLTAGE_OPCODE: [u8; 3] = [0x29, 0x15, 0x00];

// Telemetry quantities occupy the sub-slots of the per-unit identifier
// stride (4 identifiers per unit). Slot 3 is unassigned.
const TELEMETRY_SLOT_TEMPERATURE: u32 = 0;
const TELEMETRY_SLOT_CURRENT: u32 = 1;
const TELEMETRY_SLOT_VOLTAGE: u32 = 2;

/// Errors raised while constructing bus addresses.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The unit id lies outside the addressable range.
    #[error("unit id {0} out of range ({UNIT_ID_MIN}-{UNIT_ID_MAX})")]
    UnitIdOutOfRange(u8),

    /// The serial number is not exactly twelve decimal digits.
    #[error("serial number must be exactly {SERIAL_DIGITS} decimal digits, got {0:?}")]
    InvalidSerial(String),
}

/// Errors raised while validating setpoints or building frames.
///
/// Out-of-range and mis-quantized values are rejected outright, never
/// clamped, so the logical value and the on-wire value stay in lockstep.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("voltage {0} V out of range ({VOLTAGE_MIN}-{VOLTAGE_MAX})")]
    VoltageOutOfRange(f64),

    #[error("voltage {0} V not aligned to {VOLTAGE_RESOLUTION} V resolution")]
    VoltageResolution(f64),

    #[error("current limit {0} A out of range (0-{CURRENT_MAX})")]
    CurrentOutOfRange(f64),

    #[error("current limit {0} A not aligned to {CURRENT_RESOLUTION} A resolution")]
    CurrentResolution(f64),

    #[error("over-voltage protection {0} V out of range ({VOLTAGE_MIN}-{OVER_VOLTAGE_MAX})")]
    OverVoltageOutOfRange(f64),

    #[error("over-voltage protection {0} V not aligned to {VOLTAGE_RESOLUTION} V resolution")]
    OverVoltageResolution(f64),

    /// The over-voltage threshold must stay above the commanded voltage.
    #[error("over-voltage protection {ovp} V must exceed output voltage {voltage} V")]
    OvpBelowOutputVoltage { ovp: f64, voltage: f64 },

    #[error("payload of {0} bytes exceeds the CAN maximum of {MAX_PAYLOAD_LEN}")]
    PayloadTooLong(usize),
}

/// Checks that `value * factor` lands on an integer step and returns it.
fn to_fixed_point(value: f64, factor: f64) -> Option<u16> {
    const TOLERANCE: f64 = 1e-6;
    let scaled = value * factor;
    let rounded = scaled.round();
    if (scaled - rounded).abs() > TOLERANCE || !(0.0..=u16::MAX as f64).contains(&rounded) {
        None
    } else {
        Some(rounded as u16)
    }
}

/// Logical address (1-63) of one power module on the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UnitId(u8);

impl TryFrom<u8> for UnitId {
    type Error = AddressError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (UNIT_ID_MIN..=UNIT_ID_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AddressError::UnitIdOutOfRange(value))
        }
    }
}

impl UnitId {
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Twelve-digit serial number naming a physical unit, stored as six BCD
/// bytes exactly as it travels in the login payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialNumber([u8; 6]);

impl TryFrom<&str> for SerialNumber {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() != SERIAL_DIGITS || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressError::InvalidSerial(value.to_string()));
        }
        let digits = value.as_bytes();
        let mut bcd = [0u8; 6];
        for (i, pair) in digits.chunks_exact(2).enumerate() {
            bcd[i] = ((pair[0] - b'0') << 4) | (pair[1] - b'0');
        }
        Ok(Self(bcd))
    }
}

impl SerialNumber {
    /// Reassembles a serial number from its six BCD bytes.
    ///
    /// Returns `None` when any nibble is not a decimal digit, which means
    /// the bytes did not come from a valid serial.
    pub fn from_bcd(bytes: &[u8; 6]) -> Option<Self> {
        if bytes.iter().all(|b| (b >> 4) <= 9 && (b & 0x0F) <= 9) {
            Some(Self(*bytes))
        } else {
            None
        }
    }

    pub fn as_bcd(&self) -> &[u8; 6] {
        &self.0
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{}{}", byte >> 4, byte & 0x0F)?;
        }
        Ok(())
    }
}

/// Complete bus address of one rectifier: unit id plus serial number.
///
/// Constructed once from configuration and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitAddress {
    unit_id: UnitId,
    serial: SerialNumber,
}

impl UnitAddress {
    pub fn new(unit_id: UnitId, serial: SerialNumber) -> Self {
        Self { unit_id, serial }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn serial(&self) -> SerialNumber {
        self.serial
    }
}

/// Output voltage setpoint, held in 0.01 V fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Voltage(u16);

impl TryFrom<f64> for Voltage {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let centivolts = to_fixed_point(value, 1.0 / VOLTAGE_RESOLUTION)
            .ok_or(ValidationError::VoltageResolution(value))?;
        if !(VOLTAGE_MIN..=VOLTAGE_MAX).contains(&(centivolts as f64 * VOLTAGE_RESOLUTION)) {
            return Err(ValidationError::VoltageOutOfRange(value));
        }
        Ok(Self(centivolts))
    }
}

impl Voltage {
    pub fn as_volts(&self) -> f64 {
        self.0 as f64 * VOLTAGE_RESOLUTION
    }

    fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for Voltage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.as_volts())
    }
}

/// Current limit setpoint, held in 0.1 A fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Current(u16);

impl TryFrom<f64> for Current {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value < 0.0 {
            return Err(ValidationError::CurrentOutOfRange(value));
        }
        let deciamps = to_fixed_point(value, 1.0 / CURRENT_RESOLUTION)
            .ok_or(ValidationError::CurrentResolution(value))?;
        if deciamps as f64 * CURRENT_RESOLUTION > CURRENT_MAX {
            return Err(ValidationError::CurrentOutOfRange(value));
        }
        Ok(Self(deciamps))
    }
}

impl Current {
    pub fn as_amps(&self) -> f64 {
        self.0 as f64 * CURRENT_RESOLUTION
    }

    fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for Current {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}", self.as_amps())
    }
}

/// Over-voltage protection threshold, held in 0.01 V fixed-point units.
///
/// The threshold may exceed the commandable voltage range (the factory
/// default is 59.5 V), but must always stay above the commanded output
/// voltage; that relation is enforced by [`Setpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct OverVoltage(u16);

impl TryFrom<f64> for OverVoltage {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let centivolts = to_fixed_point(value, 1.0 / VOLTAGE_RESOLUTION)
            .ok_or(ValidationError::OverVoltageResolution(value))?;
        if !(VOLTAGE_MIN..=OVER_VOLTAGE_MAX).contains(&(centivolts as f64 * VOLTAGE_RESOLUTION)) {
            return Err(ValidationError::OverVoltageOutOfRange(value));
        }
        Ok(Self(centivolts))
    }
}

impl OverVoltage {
    pub fn as_volts(&self) -> f64 {
        self.0 as f64 * VOLTAGE_RESOLUTION
    }

    fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for OverVoltage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.as_volts())
    }
}

/// Protocol message classes carried in the extended identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Keep-alive frame; the payload carries the unit's serial number.
    Login,
    /// Live setpoint frame (current limit, voltage, OVP).
    Control,
    /// Persistent default-voltage write, applied after the next login
    /// cycle or power cycle rather than immediately.
    StoreDefaults,
    /// Broadcast temperature reading, one byte in whole degrees Celsius.
    TelemetryTemperature,
    /// Broadcast current reading, little-endian u16 in 0.1 A units.
    TelemetryCurrent,
    /// Broadcast voltage reading, little-endian u16 in 0.01 V units.
    TelemetryVoltage,
}

impl MessageClass {
    /// Expected payload width for telemetry classes.
    pub(crate) fn telemetry_payload_len(&self) -> Option<usize> {
        match self {
            MessageClass::TelemetryTemperature => Some(1),
            MessageClass::TelemetryCurrent | MessageClass::TelemetryVoltage => Some(2),
            _ => None,
        }
    }
}

/// One CAN frame: 29-bit extended identifier plus up to eight data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: ExtendedId,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(id: ExtendedId, data: Vec<u8>) -> Result<Self, ValidationError> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(ValidationError::PayloadTooLong(data.len()));
        }
        Ok(Self { id, data })
    }

    pub fn id(&self) -> ExtendedId {
        self.id
    }

    pub fn raw_id(&self) -> u32 {
        self.id.as_raw()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// All identifier bases plus the maximum unit offset stay well inside the
/// 29-bit space, so the fallback branch is unreachable for table values.
fn extended_id(raw: u32) -> ExtendedId {
    debug_assert!(raw <= ExtendedId::MAX.as_raw());
    ExtendedId::new(raw).unwrap_or(ExtendedId::MAX)
}

/// Encodes the extended identifier for a message class addressed at `unit`.
pub fn encode_id(class: MessageClass, unit: UnitId) -> ExtendedId {
    let unit = unit.get() as u32;
    let raw = match class {
        MessageClass::Login => LOGIN_ID_BASE + unit * 4,
        MessageClass::Control => CONTROL_ID_BASE + unit * 4,
        MessageClass::StoreDefaults => DEFAULTS_ID_BASE | (unit << 16) | DEFAULTS_ID_SUFFIX,
        MessageClass::TelemetryTemperature => {
            TELEMETRY_ID_BASE + unit * 4 + TELEMETRY_SLOT_TEMPERATURE
        }
        MessageClass::TelemetryCurrent => TELEMETRY_ID_BASE + unit * 4 + TELEMETRY_SLOT_CURRENT,
        MessageClass::TelemetryVoltage => TELEMETRY_ID_BASE + unit * 4 + TELEMETRY_SLOT_VOLTAGE,
    };
    extended_id(raw)
}

/// Decodes an extended identifier back into its message class and unit id.
///
/// Returns `None` for identifiers that do not belong to this protocol. The
/// bus is shared with other devices, so unknown identifiers are expected
/// traffic to be skipped, not an error.
pub fn decode_id(id: ExtendedId) -> Option<(MessageClass, UnitId)> {
    let raw = id.as_raw();

    let unit_from_offset = |base: u32| -> Option<(UnitId, u32)> {
        let offset = raw.checked_sub(base)?;
        let unit = UnitId::try_from(u8::try_from(offset / 4).ok()?).ok()?;
        Some((unit, offset % 4))
    };

    if (LOGIN_ID_BASE..LOGIN_ID_BASE + 0x100).contains(&raw) {
        let (unit, slot) = unit_from_offset(LOGIN_ID_BASE)?;
        return (slot == 0).then_some((MessageClass::Login, unit));
    }
    if (CONTROL_ID_BASE..CONTROL_ID_BASE + 0x100).contains(&raw) {
        let (unit, slot) = unit_from_offset(CONTROL_ID_BASE)?;
        return (slot == 0).then_some((MessageClass::Control, unit));
    }
    if (TELEMETRY_ID_BASE..TELEMETRY_ID_BASE + 0x100).contains(&raw) {
        let (unit, slot) = unit_from_offset(TELEMETRY_ID_BASE)?;
        let class = match slot {
            TELEMETRY_SLOT_TEMPERATURE => MessageClass::TelemetryTemperature,
            TELEMETRY_SLOT_CURRENT => MessageClass::TelemetryCurrent,
            TELEMETRY_SLOT_VOLTAGE => MessageClass::TelemetryVoltage,
            _ => return None,
        };
        return Some((class, unit));
    }
    if raw & 0xFF00_FFFF == DEFAULTS_ID_BASE | DEFAULTS_ID_SUFFIX {
        let unit = UnitId::try_from(((raw >> 16) & 0xFF) as u8).ok()?;
        return Some((MessageClass::StoreDefaults, unit));
    }
    None
}

/// Builds the login/keep-alive frame for a unit.
///
/// The payload is the six BCD serial bytes padded with two zero bytes; the
/// device accepts commands only while these keep arriving.
pub fn login_frame(address: &UnitAddress) -> Frame {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(address.serial().as_bcd());
    data.extend_from_slice(&[0x00, 0x00]);
    Frame {
        id: encode_id(MessageClass::Login, address.unit_id()),
        data,
    }
}

/// Live configuration commands accepted by the rectifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetVoltage(Voltage),
    SetCurrentLimit(Current),
    SetOverVoltageProtection(OverVoltage),
    /// Persist a default voltage; applied only after the next login cycle,
    /// unlike [`Command::SetVoltage`] which takes effect immediately.
    StoreDefaultVoltage(Voltage),
}

/// Last-commanded setpoint triple.
///
/// The control frame always carries current limit, voltage and OVP
/// together, so single-value commands re-emit the other two fields from
/// here. Seeded with the device's factory values until the caller commands
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setpoints {
    voltage: Voltage,
    current_limit: Current,
    over_voltage: OverVoltage,
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            voltage: Voltage(4800),
            current_limit: Current(400),
            over_voltage: OverVoltage(5950),
        }
    }
}

impl Setpoints {
    pub fn voltage(&self) -> Voltage {
        self.voltage
    }

    pub fn current_limit(&self) -> Current {
        self.current_limit
    }

    pub fn over_voltage(&self) -> OverVoltage {
        self.over_voltage
    }

    /// Applies a command and builds the frame to put on the wire.
    ///
    /// Live setpoint changes update the stored triple; the persistent
    /// default-voltage write leaves it untouched since the device applies
    /// that value only after the next login cycle.
    pub fn encode(&mut self, command: Command, unit: UnitId) -> Result<Frame, ValidationError> {
        match command {
            Command::SetVoltage(voltage) => {
                if voltage.0 >= self.over_voltage.0 {
                    return Err(ValidationError::OvpBelowOutputVoltage {
                        ovp: self.over_voltage.as_volts(),
                        voltage: voltage.as_volts(),
                    });
                }
                self.voltage = voltage;
                Ok(self.control_frame(unit))
            }
            Command::SetCurrentLimit(current) => {
                self.current_limit = current;
                Ok(self.control_frame(unit))
            }
            Command::SetOverVoltageProtection(ovp) => {
                if ovp.0 <= self.voltage.0 {
                    return Err(ValidationError::OvpBelowOutputVoltage {
                        ovp: ovp.as_volts(),
                        voltage: self.voltage.as_volts(),
                    });
                }
                self.over_voltage = ovp;
                Ok(self.control_frame(unit))
            }
            Command::StoreDefaultVoltage(voltage) => Ok(default_voltage_frame(voltage, unit)),
        }
    }

    fn control_frame(&self, unit: UnitId) -> Frame {
        let current = self.current_limit.to_le_bytes();
        let voltage = self.voltage.to_le_bytes();
        let ovp = self.over_voltage.to_le_bytes();
        // The voltage field appears twice: measurement reference and setpoint.
        let data = vec![
            current[0], current[1], voltage[0], voltage[1], voltage[0], voltage[1], ovp[0], ovp[1],
        ];
        Frame {
            id: encode_id(MessageClass::Control, unit),
            data,
        }
    }
}

fn default_voltage_frame(voltage: Voltage, unit: UnitId) -> Frame {
    let volts = voltage.to_le_bytes();
    let mut data = Vec::with_capacity(5);
    data.extend_from_slice(&DEFAULT_VOLTAGE_OPCODE);
    data.extend_from_slice(&volts);
    Frame {
        id: encode_id(MessageClass::StoreDefaults, unit),
        data,
    }
}

/// One decoded telemetry quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    /// Output voltage in volts.
    Voltage(f64),
    /// Output current in amperes.
    Current(f64),
    /// Intake temperature in whole degrees Celsius.
    Temperature(u8),
}

/// Decodes a telemetry payload for the given message class.
///
/// Returns `None` for non-telemetry classes or payloads of the wrong
/// width. Telemetry values are measurements and may legitimately fall
/// outside the commandable setpoint ranges, so no range check applies.
pub fn decode_telemetry(class: MessageClass, payload: &[u8]) -> Option<Telemetry> {
    if payload.len() != class.telemetry_payload_len()? {
        return None;
    }
    match class {
        MessageClass::TelemetryVoltage => {
            let raw = u16::from_le_bytes([payload[0], payload[1]]);
            Some(Telemetry::Voltage(raw as f64 * VOLTAGE_RESOLUTION))
        }
        MessageClass::TelemetryCurrent => {
            let raw = u16::from_le_bytes([payload[0], payload[1]]);
            Some(Telemetry::Current(raw as f64 * CURRENT_RESOLUTION))
        }
        MessageClass::TelemetryTemperature => Some(Telemetry::Temperature(payload[0])),
        _ => None,
    }
}
