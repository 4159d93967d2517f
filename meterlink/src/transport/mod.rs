//! Byte-stream transports.
//!
//! A [`Transport`] opens and closes the physical link and writes raw bytes.
//! Received bytes flow the other way through a [`ChunkSender`] handed over at
//! connect time, in whatever fragments the link happens to deliver.
//!
//! ```text
//! +-------------+   send_binary()   +-------------+
//! |    Link     | ----------------> |  Transport  |
//! | (protocol)  | <---------------- | (serial,    |
//! +-------------+   ChunkSender     |  memory)    |
//!                                   +-------------+
//! ```

pub mod memory;
#[cfg(feature = "native")]
pub mod serial;

use crate::error::Result;
use tokio::sync::mpsc;

pub use memory::{DeviceControl, DeviceEnd, MemoryTransport};
#[cfg(feature = "native")]
pub use serial::{SerialConfig, SerialTransport};

/// Sending half of the received-chunk channel.
pub type ChunkSender = mpsc::UnboundedSender<Vec<u8>>;

/// Receiving half of the received-chunk channel.
pub type ChunkReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Create a received-chunk channel.
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::unbounded_channel()
}

/// Physical link to the instrument.
pub trait Transport: Send {
    /// Open the link and start forwarding received chunks into `incoming`.
    ///
    /// `Ok(false)` means the link could not be opened without a lower-level
    /// error to report.
    fn connect(&mut self, incoming: ChunkSender) -> Result<bool>;

    /// Stop forwarding and release the link. Calling it twice is harmless.
    fn disconnect(&mut self) -> Result<()>;

    /// Write raw bytes.
    fn send_binary(&mut self, bytes: &[u8]) -> Result<()>;

    /// Name of the link (port path, pipe label).
    fn name(&self) -> &str;
}

/// Printable preview of a received chunk.
///
/// Invalid UTF-8 becomes `U+FFFD`; control characters other than tab and
/// newline become `.`.
pub fn text_preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|ch| match ch {
            '\n' | '\t' => ch,
            _ if ch.is_control() => '.',
            _ => ch,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_preview_printable() {
        assert_eq!(text_preview(b"OK\n"), "OK\n");
    }

    #[test]
    fn test_text_preview_control_and_invalid() {
        assert_eq!(text_preview(&[0x01, b'A', 0x00, 0xFF, b'\t']), ".A.\u{FFFD}\t");
        assert_eq!(text_preview(b"a\rb"), "a.b");
    }
}
