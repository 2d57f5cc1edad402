use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use flatpack2_lib::protocol as proto;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1") // Common default for Windows, though may vary.
    } else {
        String::from("/dev/ttyUSB0") // Common default for USB SLCAN adapters on Linux.
    }
}

fn parse_unit_id(s: &str) -> Result<proto::UnitId, String> {
    let id = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))?;
    proto::UnitId::try_from(id).map_err(|e| e.to_string())
}

fn parse_serial(s: &str) -> Result<proto::SerialNumber, String> {
    proto::SerialNumber::try_from(s).map_err(|e| e.to_string())
}

fn parse_voltage(s: &str) -> Result<proto::Voltage, String> {
    let volts = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid voltage value format: {e}"))?;
    proto::Voltage::try_from(volts).map_err(|e| e.to_string())
}

fn parse_current(s: &str) -> Result<proto::Current, String> {
    let amps = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid current value format: {e}"))?;
    proto::Current::try_from(amps).map_err(|e| e.to_string())
}

fn parse_over_voltage(s: &str) -> Result<proto::OverVoltage, String> {
    let volts = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid over-voltage value format: {e}"))?;
    proto::OverVoltage::try_from(volts).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Set one or more live setpoints on the rectifier.
    /// Changes apply immediately and last until the unit logs out or
    /// power-cycles; use store-default-voltage for a persistent value.
    #[clap(verbatim_doc_comment)]
    Set {
        /// Live output voltage in volts (43.5 to 57.4, 0.01 V steps).
        #[arg(long, value_parser = parse_voltage)]
        voltage: Option<proto::Voltage>,

        /// Current limit in amperes (0 to 41.7, 0.1 A steps).
        #[arg(long, value_parser = parse_current)]
        current: Option<proto::Current>,

        /// Over-voltage protection threshold in volts.
        /// Must exceed the commanded output voltage.
        #[arg(long, value_parser = parse_over_voltage, verbatim_doc_comment)]
        ovp: Option<proto::OverVoltage>,
    },

    /// Store a persistent default output voltage in the rectifier.
    /// **Important:** The stored value takes effect only after the unit
    /// logs out or power-cycles, not immediately.
    #[clap(verbatim_doc_comment)]
    StoreDefaultVoltage {
        /// Default voltage in volts (43.5 to 57.4, 0.01 V steps).
        #[arg(value_parser = parse_voltage)]
        voltage: proto::Voltage,
    },

    /// Read and display one status snapshot (voltage, current, temperature).
    Status,

    /// Monitor the rectifier continuously, printing telemetry as it
    /// arrives. Stop with Ctrl-C or after --duration.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Stop monitoring after this long (e.g. "30s", "5m").
        /// Runs until interrupted when omitted.
        #[arg(long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
        duration: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "Flatpack2 CLI - Control and monitor Eltek Flatpack2 rectifiers over a serial SLCAN adapter."
}

#[derive(Parser, Debug)]
#[command(name="fpctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Serial port of the SLCAN adapter.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Unit id of the rectifier on the bus (1 to 63).
    /// Can be specified in decimal or hexadecimal (e.g. "0x01" to "0x3F").
    #[arg(short, long, default_value = "1", value_parser = parse_unit_id, verbatim_doc_comment)]
    pub unit_id: proto::UnitId,

    /// Twelve-digit serial number of the rectifier, used for the login
    /// handshake. Printed on the unit's label.
    #[arg(short, long, value_parser = parse_serial, verbatim_doc_comment)]
    pub serial: proto::SerialNumber,

    /// How long to wait for a status snapshot.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "2s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    #[command(subcommand)]
    pub command: CliCommands,
}
