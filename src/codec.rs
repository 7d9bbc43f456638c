//! V5 frame codec.
//!
//! Just enough of the SolarmanV5 envelope to route packets: start/end
//! markers and the 4-byte little-endian logger serial. Payload semantics
//! are not interpreted.
//!
//! ```text
//! [0xa5] [len: u16 LE] [type: u16] [seq: u16] [serial: u32 LE] [payload] [checksum: u8] [0x15]
//! ```

use anyhow::{bail, Result};

const START: u8 = 0xa5;
const END: u8 = 0x15;
const MIN_FRAME_LEN: usize = 13;

/// Read-holding-registers probe frame, written to every logger on connect.
/// A Modbus-RTU read-holding-registers request wrapped in a V5 envelope;
/// three sibling probes exist (coils/discrete/input) but the proxy only
/// ever sends this variant.
pub const SERIAL_PROBE: [u8; 36] = [
    0xa5, 0x17, 0x00, 0x10, 0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01,
    0xd5, 0xca, 0x13, 0x15,
];

/// A parsed V5 frame. Only the serial field is extracted; the rest of the
/// envelope is left in the original buffer since the proxy forwards raw
/// bytes rather than re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    serial: u32,
}

impl Frame {
    /// The 32-bit logger serial carried by this frame.
    pub fn serial(&self) -> u32 {
        self.serial
    }
}

/// Parse a single V5 frame out of `data`.
///
/// Does not verify the checksum — the proxy forwards raw bytes and never
/// inspects or re-encodes payload contents.
pub fn parse(data: &[u8]) -> Result<Frame> {
    if data.len() < MIN_FRAME_LEN {
        bail!("frame too short: {} bytes", data.len());
    }
    if data[0] != START {
        bail!("bad start byte: 0x{:02x}", data[0]);
    }
    if data[data.len() - 1] != END {
        bail!("bad end byte: 0x{:02x}", data[data.len() - 1]);
    }
    let serial = u32::from_le_bytes([data[7], data[8], data[9], data[10]]);
    Ok(Frame { serial })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(serial: u32) -> Vec<u8> {
        let mut buf = vec![START, 0x07, 0x00, 0x10, 0x45, 0x00, 0x00];
        buf.extend_from_slice(&serial.to_le_bytes());
        buf.push(0x01); // 1-byte payload
        let checksum: u8 = buf[1..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        buf.push(checksum);
        buf.push(END);
        buf
    }

    #[test]
    fn parses_serial_from_valid_frame() {
        let buf = sample_frame(0x0403_0201);
        let frame = parse(&buf).unwrap();
        assert_eq!(frame.serial(), 0x0403_0201);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(parse(&[0xa5, 0x15]).is_err());
    }

    #[test]
    fn rejects_bad_start_byte() {
        let mut buf = sample_frame(1);
        buf[0] = 0x00;
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn rejects_bad_end_byte() {
        let mut buf = sample_frame(1);
        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn serial_probe_is_well_formed() {
        assert_eq!(SERIAL_PROBE[0], START);
        assert_eq!(SERIAL_PROBE[SERIAL_PROBE.len() - 1], END);
        assert_eq!(SERIAL_PROBE.len(), 36);
        assert!(parse(&SERIAL_PROBE).is_ok());
    }
}
