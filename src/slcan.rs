//! SLCAN (Lawicel ASCII) transport over a serial CAN adapter.
//!
//! The Flatpack2 sits on a 125 kbps CAN bus reached through a USB
//! serial-to-CAN adapter speaking the SLCAN line protocol: one ASCII line
//! per frame, `T<id:8 hex><dlc:1 hex><data:2 hex per byte>` for extended
//! data frames, terminated by a carriage return. [`open`] configures the
//! adapter for 125 kbps, opens the channel and splits the port into the
//! [`FrameSink`]/[`FrameSource`] halves the engine consumes.

use crate::protocol::{Frame, MAX_PAYLOAD_LEN};
use crate::transport::{FrameSink, FrameSource, TransportError};
use embedded_can::ExtendedId;
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::SerialStream;

/// Serial baud rate of the adapter itself (not the CAN bitrate).
pub const SERIAL_BAUD: u32 = 115_200;

// Adapter setup: close a possibly open channel, select 125 kbps (`S4`),
// then open the channel.
const INIT_SEQUENCE: &[u8] = b"\rC\rS4\rO\r";

/// Opens an SLCAN adapter at `device` and configures it for the 125 kbps
/// Flatpack2 bus.
pub async fn open(device: &str) -> Result<(SlcanSink, SlcanSource), TransportError> {
    let builder = tokio_serial::new(device, SERIAL_BAUD)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .data_bits(tokio_serial::DataBits::Eight)
        .flow_control(tokio_serial::FlowControl::None);
    let mut port = SerialStream::open(&builder)?;
    port.write_all(INIT_SEQUENCE).await?;
    port.flush().await?;

    let (reader, writer) = tokio::io::split(port);
    Ok((
        SlcanSink { writer },
        SlcanSource {
            reader,
            buf: Vec::new(),
        },
    ))
}

/// Write half of an SLCAN port.
pub struct SlcanSink {
    writer: WriteHalf<SerialStream>,
}

impl FrameSink for SlcanSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let line = encode_frame(frame);
        trace!("slcan tx: {}", line.trim_end());
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read half of an SLCAN port with its line reassembly buffer.
pub struct SlcanSource {
    reader: ReadHalf<SerialStream>,
    buf: Vec<u8>,
}

impl FrameSource for SlcanSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
                let line = String::from_utf8_lossy(&line).into_owned();
                if let Some(frame) = parse_line(&line)? {
                    return Ok(Some(frame));
                }
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

/// Encodes one extended data frame as an SLCAN line.
pub fn encode_frame(frame: &Frame) -> String {
    let mut line = format!("T{:08X}{:X}", frame.raw_id(), frame.data().len());
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push('\r');
    line
}

/// Parses one SLCAN line.
///
/// Returns `Ok(None)` for lines that are not extended data frames:
/// standard-id frames, remote frames, command acknowledgements and status
/// chatter all pass by without becoming frames or errors. A line that
/// claims to be an extended data frame but does not parse is a real
/// adapter fault and reported as [`TransportError::MalformedLine`].
pub fn parse_line(line: &str) -> Result<Option<Frame>, TransportError> {
    if !line.starts_with('T') {
        return Ok(None);
    }
    let malformed = || TransportError::MalformedLine(line.to_string());

    let bytes = line.as_bytes();
    if !line.is_ascii() || bytes.len() < 10 {
        return Err(malformed());
    }
    let raw_id = u32::from_str_radix(&line[1..9], 16).map_err(|_| malformed())?;
    let id = ExtendedId::new(raw_id).ok_or_else(malformed)?;
    let dlc = usize::from_str_radix(&line[9..10], 16).map_err(|_| malformed())?;
    if dlc > MAX_PAYLOAD_LEN || bytes.len() != 10 + dlc * 2 {
        return Err(malformed());
    }
    let mut data = Vec::with_capacity(dlc);
    for i in 0..dlc {
        let offset = 10 + i * 2;
        let byte = u8::from_str_radix(&line[offset..offset + 2], 16).map_err(|_| malformed())?;
        data.push(byte);
    }
    let frame = Frame::new(id, data).map_err(|_| malformed())?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frame(raw_id: u32, data: &[u8]) -> Frame {
        Frame::new(ExtendedId::new(raw_id).unwrap(), data.to_vec()).unwrap()
    }

    #[test]
    fn encode_extended_data_frame() {
        let f = frame(0x0500_4804, &[0x13, 0x43, 0x72, 0x10, 0x50, 0x69, 0x00, 0x00]);
        assert_eq!(encode_frame(&f), "T0500480481343721050690000\r");
    }

    #[test]
    fn encode_empty_payload() {
        let f = frame(0x1FFF_FFFF, &[]);
        assert_eq!(encode_frame(&f), "T1FFFFFFF0\r");
    }

    #[test]
    fn parse_roundtrip() {
        let f = frame(0x0501_4006, &[0xC0, 0x12]);
        let line = encode_frame(&f);
        let parsed = parse_line(line.trim_end()).unwrap();
        assert_eq!(parsed, Some(f));
    }

    #[test]
    fn parse_skips_non_data_lines() {
        // Standard-id frames, remote frames and adapter chatter.
        assert_eq!(parse_line("t12320102").unwrap(), None);
        assert_eq!(parse_line("R05FF40040").unwrap(), None);
        assert_eq!(parse_line("z").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
    }

    #[test]
    fn parse_rejects_garbled_extended_frames() {
        assert_matches!(parse_line("T123"), Err(TransportError::MalformedLine(_)));
        // DLC says two bytes but only one follows.
        assert_matches!(
            parse_line("T05014006212"),
            Err(TransportError::MalformedLine(_))
        );
        // Identifier above the 29-bit space.
        assert_matches!(
            parse_line("TFFFFFFFF0"),
            Err(TransportError::MalformedLine(_))
        );
        assert_matches!(
            parse_line("T0501400&10A"),
            Err(TransportError::MalformedLine(_))
        );
    }
}
