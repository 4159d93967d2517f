//! Error types for meterlink.

use std::io;
use thiserror::Error;

/// Result type for meterlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for meterlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Packet checksum mismatch.
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum recomputed over the received bytes.
        expected: u16,
        /// Checksum carried in the packet trailer.
        actual: u16,
    },

    /// A packet header declared a payload larger than the reassembly limit.
    #[error("Framing overflow: declared payload of {declared} bytes exceeds limit of {limit}")]
    FramingOverflow {
        /// Payload length taken from the header.
        declared: usize,
        /// Configured maximum payload length.
        limit: usize,
    },

    /// Malformed or unexpected protocol data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// User-supplied input could not be encoded into bytes.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// No serial port available for auto-detection.
    #[error("No serial port found")]
    DeviceNotFound,

    /// The transport refused to open.
    #[error("Could not connect to {0}")]
    ConnectFailed(String),

    /// A connection is already open or being opened.
    #[error("Already connected")]
    AlreadyConnected,

    /// The link is not in the verified state.
    #[error("Not connected to a verified device")]
    NotConnected,

    /// The link was torn down while an operation was waiting.
    #[error("Link disconnected")]
    Disconnected,

    /// No identification response arrived during the handshake.
    #[error("Handshake timeout: no identification response within {0} ms")]
    HandshakeTimeout(u64),

    /// The device identified as a different model.
    #[error("Unexpected device model: expected {expected}, found {actual}")]
    UnexpectedModel {
        /// Accepted target model.
        expected: String,
        /// Model decoded from the identification response.
        actual: String,
    },

    /// A correlated request timed out.
    #[error("Timeout waiting for response to command {command:#04x}")]
    RequestTimeout {
        /// Command code the request was waiting for.
        command: u8,
    },

    /// Another request is still waiting for its response.
    #[error("Another request is in flight (waiting for command {0:#04x})")]
    RequestInFlight(u8),

    /// The bulk download stopped on a failed request.
    #[error("Download aborted at measurement {measurement}{}: {source}", packet_suffix(.packet))]
    DownloadAborted {
        /// 1-based measurement index (0 for the result count request).
        measurement: u16,
        /// 1-based packet index, when the failure hit a data request.
        packet: Option<u16>,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Operation stopped by the embedding application.
    #[error("Interrupted")]
    Interrupted,
}

fn packet_suffix(packet: &Option<u16>) -> String {
    packet.map(|p| format!(", packet {p}")).unwrap_or_default()
}

impl Error {
    /// Whether this error is a timeout of either the handshake or a request.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::HandshakeTimeout(_) | Self::RequestTimeout { .. } => true,
            Self::DownloadAborted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_aborted_message() {
        let err = Error::DownloadAborted {
            measurement: 2,
            packet: Some(3),
            source: Box::new(Error::RequestTimeout { command: 0x20 }),
        };
        let message = err.to_string();
        assert!(message.starts_with("Download aborted at measurement 2, packet 3: "));
        assert!(message.ends_with("Timeout waiting for response to command 0x20"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_download_aborted_without_packet() {
        let err = Error::DownloadAborted {
            measurement: 0,
            packet: None,
            source: Box::new(Error::Disconnected),
        };
        assert_eq!(
            err.to_string(),
            "Download aborted at measurement 0: Link disconnected"
        );
        assert!(!err.is_timeout());
    }
}
