//! Flatpack2 CLI
//!
//! A command-line interface (CLI) application for controlling and
//! monitoring Eltek Flatpack2 rectifiers over a serial SLCAN adapter.
//!
//! This tool allows users to:
//! - Set the live output voltage, current limit and over-voltage
//!   protection threshold.
//! - Store a persistent default voltage (applied after logout/power-cycle).
//! - Read a single status snapshot of voltage, current and temperature.
//! - Monitor telemetry continuously until interrupted.
//!
//! The CLI leverages the `flatpack2_lib` crate for protocol definitions
//! and the protocol engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flatpack2_lib::{
    engine::ProtocolEngine,
    protocol::UnitAddress,
    slcan,
    status::StatusReading,
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::io::{stdout, Write};
use std::{panic, time::Duration};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0)); // Provide defaults

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Waits for the next snapshot that belongs to the configured unit.
async fn next_unit_snapshot(
    monitor: &mut broadcast::Receiver<StatusReading>,
    unit_id: flatpack2_lib::protocol::UnitId,
) -> Result<StatusReading> {
    loop {
        match monitor.recv().await {
            Ok(reading) if reading.unit_id() == unit_id => return Ok(reading),
            Ok(_) => continue, // Telemetry from another unit on the bus.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("monitor lagged, skipped {skipped} snapshots");
            }
            Err(broadcast::error::RecvError::Closed) => bail!("Protocol engine stopped"),
        }
    }
}

/// Handles the status command: one snapshot, preferring a complete one.
///
/// Telemetry quantities arrive as separate frames, so the first snapshot
/// may be partial. Keep folding frames in until the record is complete or
/// the timeout expires, then print whatever was gathered.
async fn handle_status(engine: &ProtocolEngine, args: &commandline::CliArgs) -> Result<()> {
    let mut monitor = engine.monitor();
    let deadline = Instant::now() + args.timeout;
    let mut last: Option<StatusReading> = None;

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, next_unit_snapshot(&mut monitor, args.unit_id)).await {
            Ok(reading) => {
                let reading = reading?;
                let complete = reading.is_complete();
                last = Some(reading);
                if complete {
                    break;
                }
            }
            Err(_) => break, // Timeout; report what we have.
        }
    }

    match last {
        Some(reading) => {
            println!("{reading}");
            Ok(())
        }
        None => bail!(
            "No response from Flatpack2 unit {} within {:?}",
            args.unit_id,
            args.timeout
        ),
    }
}

/// Prints every snapshot for the configured unit; returns only on error.
async fn stream_readings(
    monitor: &mut broadcast::Receiver<StatusReading>,
    unit_id: flatpack2_lib::protocol::UnitId,
) -> Result<()> {
    loop {
        let reading = next_unit_snapshot(monitor, unit_id).await?;
        print!("\r{reading}");
        stdout().flush().context("Failed to flush stdout")?;
    }
}

/// Handles the monitor command: stream snapshots until Ctrl-C or the
/// optional duration elapses.
async fn handle_monitor(
    engine: &ProtocolEngine,
    args: &commandline::CliArgs,
    duration: Option<Duration>,
) -> Result<()> {
    let mut monitor = engine.monitor();
    println!(
        "Monitoring Flatpack2 unit {} ... Ctrl-C to stop",
        args.unit_id
    );

    let limit = async {
        match duration {
            Some(limit) => sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = stream_readings(&mut monitor, args.unit_id) => result?,
        _ = limit => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    println!();
    info!("Stopped monitoring");
    Ok(())
}

/// Handles the store-default-voltage command.
///
/// This is a persistent write to the rectifier, so the user is asked to
/// confirm before anything goes on the wire.
async fn handle_store_default(
    engine: &ProtocolEngine,
    voltage: flatpack2_lib::protocol::Voltage,
) -> Result<()> {
    println!(
        "This stores {voltage} V as the rectifier's persistent default output voltage.\n\
         The new default takes effect only after the unit logs out or power-cycles."
    );
    if !Confirm::new()
        .with_prompt("Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Store default voltage aborted by user.");
        return Ok(());
    }

    engine
        .store_default_voltage(voltage.as_volts())
        .await
        .with_context(|| format!("Failed to store default voltage {voltage} V"))?;
    println!("Default voltage command sent: {voltage} V");
    println!("Note: the value applies after the next logout or power cycle.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Flatpack2 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let address = UnitAddress::new(args.unit_id, args.serial);
    info!(
        "Connecting to SLCAN adapter {} (unit {}, serial {})...",
        args.device,
        args.unit_id,
        args.serial
    );
    let (sink, source) = slcan::open(&args.device)
        .await
        .with_context(|| format!("Cannot open SLCAN adapter on {}", args.device))?;

    let mut engine = ProtocolEngine::start(sink, source, address);

    // The writer and receive loop already log failures; drain the error
    // channel so it cannot grow without bound.
    if let Some(mut errors) = engine.take_errors() {
        tokio::spawn(async move { while errors.recv().await.is_some() {} });
    }

    let result = match &args.command {
        commandline::CliCommands::Set {
            voltage,
            current,
            ovp,
        } => {
            if voltage.is_none() && current.is_none() && ovp.is_none() {
                bail!("Nothing to set: pass at least one of --voltage, --current, --ovp");
            }
            // Raise OVP before the voltage so an increase above the old
            // threshold is not rejected.
            if let Some(ovp) = ovp {
                info!("Executing: Set over-voltage protection to {ovp} V");
                engine
                    .set_over_voltage_protection(ovp.as_volts())
                    .await
                    .with_context(|| format!("Failed to set over-voltage protection to {ovp} V"))?;
                println!("Over-voltage protection set to {ovp} V");
            }
            if let Some(voltage) = voltage {
                info!("Executing: Set output voltage to {voltage} V");
                engine
                    .set_voltage(voltage.as_volts())
                    .await
                    .with_context(|| format!("Failed to set output voltage to {voltage} V"))?;
                println!("Output voltage set to {voltage} V");
            }
            if let Some(current) = current {
                info!("Executing: Set current limit to {current} A");
                engine
                    .set_current_limit(current.as_amps())
                    .await
                    .with_context(|| format!("Failed to set current limit to {current} A"))?;
                println!("Current limit set to {current} A");
            }
            Ok(())
        }
        commandline::CliCommands::StoreDefaultVoltage { voltage } => {
            handle_store_default(&engine, *voltage).await
        }
        commandline::CliCommands::Status => {
            info!("Executing: Read status snapshot");
            handle_status(&engine, &args).await
        }
        commandline::CliCommands::Monitor { duration } => {
            handle_monitor(&engine, &args, *duration).await
        }
    };

    engine.stop().await;
    result
}
