//! Stream reassembly: raw byte chunks in, complete packet candidates out.
//!
//! The transport delivers arbitrary fragments of the byte stream. Bytes are
//! appended to an internal buffer and complete packets are cut from its
//! front as soon as their declared length is available. A packet split
//! across chunks stays buffered until the rest arrives; one chunk holding
//! several packets yields all of them, in order.

use crate::error::{Error, Result};
use crate::protocol::packet::{MIN_PACKET_LEN, Packet, declared_packet_len, validate_packet};
use log::{trace, warn};

/// Default ceiling for a declared payload length.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 8192;

/// Outcome of one extraction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// A complete packet whose checksum matched.
    Packet(Packet),
    /// A complete packet that failed checksum validation. Its bytes were consumed.
    Corrupt {
        /// Raw bytes of the discarded packet.
        bytes: Vec<u8>,
    },
    /// A header declared more payload than allowed; bytes up to the next
    /// plausible packet start were dropped.
    Overflow {
        /// Payload length taken from the header.
        declared: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Accumulates received bytes and extracts packet candidates.
#[derive(Debug)]
pub struct StreamReassembler {
    buffer: Vec<u8>,
    max_payload_len: usize,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl StreamReassembler {
    /// Create a reassembler rejecting payloads longer than `max_payload_len`.
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload_len,
        }
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut the next complete packet off the front of the buffer.
    ///
    /// Returns `Ok(None)` while the buffered bytes do not yet form a whole
    /// packet. A header declaring an oversized payload returns
    /// [`Error::FramingOverflow`] after dropping the bytes before the next
    /// plausible packet start; later calls continue from there.
    pub fn next_candidate(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < MIN_PACKET_LEN {
            return Ok(None);
        }

        let Some(total) = declared_packet_len(&self.buffer) else {
            return Ok(None);
        };
        let declared = total - MIN_PACKET_LEN;
        if declared > self.max_payload_len {
            let skipped = self.resync_offset();
            self.buffer.drain(..skipped);
            warn!(
                "Declared payload {declared} exceeds {}, skipped {skipped} bytes",
                self.max_payload_len
            );
            return Err(Error::FramingOverflow {
                declared,
                limit: self.max_payload_len,
            });
        }

        if self.buffer.len() < total {
            trace!("Partial packet: {}/{total} bytes buffered", self.buffer.len());
            return Ok(None);
        }

        Ok(Some(self.buffer.drain(..total).collect()))
    }

    /// Offset of the next packet start after a bad header at offset 0.
    ///
    /// A complete packet with a matching checksum wins. Failing that, the
    /// first offset whose header is within the limit (or too short to read)
    /// is kept, since its packet may still be arriving.
    fn resync_offset(&self) -> usize {
        let within_limit = |start: &usize| {
            declared_packet_len(&self.buffer[*start..])
                .is_none_or(|total| total - MIN_PACKET_LEN <= self.max_payload_len)
        };
        let is_valid_packet = |start: &usize| {
            let rest = &self.buffer[*start..];
            declared_packet_len(rest)
                .is_some_and(|total| rest.len() >= total && validate_packet(&rest[..total]))
        };

        (1..self.buffer.len())
            .filter(within_limit)
            .find(is_valid_packet)
            .or_else(|| (1..self.buffer.len()).find(within_limit))
            .unwrap_or(self.buffer.len())
    }

    /// Push a chunk and extract every candidate it completes.
    pub fn extract(&mut self, chunk: &[u8]) -> Vec<Candidate> {
        self.push(chunk);

        let mut out = Vec::new();
        loop {
            match self.next_candidate() {
                Ok(Some(bytes)) => match Packet::decode(&bytes) {
                    Ok(packet) => out.push(Candidate::Packet(packet)),
                    Err(_) => out.push(Candidate::Corrupt { bytes }),
                },
                Ok(None) => break,
                Err(Error::FramingOverflow { declared, limit }) => {
                    out.push(Candidate::Overflow { declared, limit });
                },
                Err(_) => break,
            }
        }
        out
    }

    /// Number of bytes waiting for the rest of their packet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Configured payload limit.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }
}
