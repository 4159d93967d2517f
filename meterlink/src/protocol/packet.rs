//! Packet codec for the instrument protocol.
//!
//! ## Packet Format
//!
//! ```text
//! +---------+-------------+---------------+----------+
//! | Command | Data length |     Data      | Checksum |
//! +---------+-------------+---------------+----------+
//! | 1 byte  | 2 bytes (LE)|   N bytes     | 2 bytes  |
//! +---------+-------------+---------------+----------+
//! ```
//!
//! The checksum is CRC-16/XMODEM over command, length and data, stored
//! little-endian.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Command byte plus length field.
pub const HEADER_LEN: usize = 3;

/// Trailing checksum length.
pub const CHECKSUM_LEN: usize = 2;

/// Smallest possible packet (empty payload).
pub const MIN_PACKET_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Command codes understood by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Identification request/response (0x01).
    IdGet = 0x01,
    /// Paged result request/response (0x20).
    ResultGet = 0x20,
}

impl Command {
    /// Map a raw command byte to a known command.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IdGet),
            0x20 => Some(Self::ResultGet),
            _ => None,
        }
    }

    /// Look up a command by its protocol name (`ID_GET`, `RESULT_GET`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().replace('-', "_").as_str() {
            "ID_GET" => Some(Self::IdGet),
            "RESULT_GET" => Some(Self::ResultGet),
            _ => None,
        }
    }

    /// Protocol name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Self::IdGet => "ID_GET",
            Self::ResultGet => "RESULT_GET",
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable label for a raw command byte.
pub fn command_label(command: u8) -> String {
    match Command::from_u8(command) {
        Some(cmd) => format!("{cmd} (0x{command:02X})"),
        None => format!("0x{command:02X}"),
    }
}

/// Build the wire bytes for `command` carrying `data`.
///
/// Any command/payload combination is encodable; callers keep the payload
/// within the 16-bit length field.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn build_packet(command: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN + data.len());
    buf.push(command);
    buf.write_u16::<LittleEndian>(data.len() as u16).unwrap();
    buf.extend_from_slice(data);

    let crc = crc16_xmodem(&buf);
    buf.write_u16::<LittleEndian>(crc).unwrap();
    buf
}

/// Check a candidate full-length packet against its trailing checksum.
///
/// Returns `false` for anything too short or whose length field disagrees
/// with the slice length.
pub fn validate_packet(bytes: &[u8]) -> bool {
    checksums(bytes).is_some_and(|(expected, actual)| expected == actual)
}

/// Recomputed and embedded checksum of a well-sized candidate.
fn checksums(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < MIN_PACKET_LEN {
        return None;
    }
    let declared = usize::from(LittleEndian::read_u16(&bytes[1..HEADER_LEN]));
    if bytes.len() != MIN_PACKET_LEN + declared {
        return None;
    }
    let split = bytes.len() - CHECKSUM_LEN;
    let expected = crc16_xmodem(&bytes[..split]);
    let actual = LittleEndian::read_u16(&bytes[split..]);
    Some((expected, actual))
}

/// Total wire length implied by a buffered header, if enough of it is present.
pub fn declared_packet_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let len = usize::from(LittleEndian::read_u16(&header[1..HEADER_LEN]));
    Some(MIN_PACKET_LEN + len)
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command byte.
    pub command: u8,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a packet from a raw command byte.
    pub fn new(command: u8, data: Vec<u8>) -> Self {
        Self { command, data }
    }

    /// Validate and decode a complete packet.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (expected, actual) = checksums(bytes).ok_or_else(|| {
            Error::Protocol(format!("malformed packet of {} bytes", bytes.len()))
        })?;
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            command: bytes[0],
            data: bytes[HEADER_LEN..bytes.len() - CHECKSUM_LEN].to_vec(),
        })
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        build_packet(self.command, &self.data)
    }

    /// Known command, if any.
    pub fn known_command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }
}

/// Sub-operations carried in `RESULT_GET` request payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultQuery {
    /// Number of stored measurements.
    Count,
    /// Number of data packets making up a measurement (1-based index).
    PacketCount {
        /// Measurement index.
        measurement: u16,
    },
    /// One data packet of a measurement (both indices 1-based).
    Data {
        /// Measurement index.
        measurement: u16,
        /// Packet index within the measurement.
        packet: u16,
    },
}

impl ResultQuery {
    /// Sub-operation byte for result count.
    pub const COUNT: u8 = 0x00;
    /// Sub-operation byte for packet count.
    pub const PACKET_COUNT: u8 = 0x01;
    /// Sub-operation byte for a data packet.
    pub const DATA: u8 = 0x02;

    /// Request payload for this query.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn payload(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(5);
        match self {
            Self::Count => data.push(Self::COUNT),
            Self::PacketCount { measurement } => {
                data.push(Self::PACKET_COUNT);
                data.write_u16::<LittleEndian>(measurement).unwrap();
            },
            Self::Data {
                measurement,
                packet,
            } => {
                data.push(Self::DATA);
                data.write_u16::<LittleEndian>(measurement).unwrap();
                data.write_u16::<LittleEndian>(packet).unwrap();
            },
        }
        data
    }

    /// Parse a request payload (device side of the exchange).
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [Self::COUNT] => Some(Self::Count),
            [Self::PACKET_COUNT, lo, hi] => Some(Self::PacketCount {
                measurement: u16::from_le_bytes([*lo, *hi]),
            }),
            [Self::DATA, m_lo, m_hi, p_lo, p_hi] => Some(Self::Data {
                measurement: u16::from_le_bytes([*m_lo, *m_hi]),
                packet: u16::from_le_bytes([*p_lo, *p_hi]),
            }),
            _ => None,
        }
    }

    /// Full request packet for this query.
    pub fn to_packet(self) -> Vec<u8> {
        build_packet(Command::ResultGet.into(), &self.payload())
    }
}

/// Decode a count response: unsigned little-endian, 1 to 4 bytes wide.
pub fn decode_count(data: &[u8]) -> Result<u32> {
    if data.is_empty() || data.len() > 4 {
        return Err(Error::Protocol(format!(
            "count response must be 1-4 bytes, got {}",
            data.len()
        )));
    }
    Ok(data
        .iter()
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Parse user-supplied hex text into bytes.
///
/// Accepts an optional `0x` prefix and whitespace, `:` or `,` separators,
/// e.g. `"01 02 ff"`, `"0x0102FF"`, `"01:02:ff"`.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text
        .split(|c: char| c.is_whitespace() || c == ':' || c == ',')
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.strip_prefix("0x")
                .or_else(|| tok.strip_prefix("0X"))
                .unwrap_or(tok)
        })
        .map(|tok| {
            if tok.len() % 2 == 1 {
                format!("0{tok}")
            } else {
                tok.to_string()
            }
        })
        .collect();

    hex::decode(&cleaned).map_err(|e| Error::Encoding(format!("invalid hex input '{text}': {e}")))
}
