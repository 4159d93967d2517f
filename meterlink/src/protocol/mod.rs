//! Protocol implementations.

pub mod crc;
pub mod packet;
pub mod reassembler;

// Re-export common types
pub use packet::{
    Command, Packet, ResultQuery, build_packet, decode_count, parse_hex_bytes, validate_packet,
};
pub use reassembler::{Candidate, StreamReassembler};
