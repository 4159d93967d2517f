//! # meterlink
//!
//! A library for talking to MX-series measurement instruments over a serial
//! link.
//!
//! This crate provides:
//!
//! - Packet codec with CRC16-XMODEM checksum
//! - Stream reassembly of fragmented packets
//! - Connection handshake with device model verification
//! - Single-slot request/response correlation with timeouts
//! - Paged bulk download of stored measurements
//!
//! ## Features
//!
//! - `native` (default): serial port transport via the `serialport` crate
//! - `serde`: serialization of identity snapshots and port listings
//!
//! ## Example
//!
//! ```rust,no_run
//! use meterlink::{Link, LinkConfig, MeasurementDownloader, SerialConfig, SerialTransport};
//!
//! # async fn run() -> meterlink::Result<()> {
//! let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115_200));
//! let link = Link::new(transport, LinkConfig::default());
//!
//! let identity = link.connect().await?;
//! println!("Connected to {identity}");
//!
//! let report = MeasurementDownloader::new(&link)
//!     .run(
//!         &mut |p| println!("{}/{}", p.current, p.total),
//!         &mut |record| {
//!             println!("measurement {}: {} bytes", record.index, record.data.len());
//!             Ok(())
//!         },
//!     )
//!     .await?;
//! println!("{} bytes total", report.total_bytes());
//!
//! link.disconnect()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod download;
pub mod error;
pub mod export;
pub mod link;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod sim;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::{SerialConfig, SerialTransport};
pub use {
    device::{
        BridgeKind, DetectedPort, DeviceIdentity, DeviceModel, discover_ports, find_port_by_pattern,
        format_port_list, identify_device, parse_device_info, select_port,
    },
    download::{
        DownloadOptions, DownloadProgress, DownloadReport, MeasurementDownloader,
        MeasurementRecord,
    },
    error::{Error, Result},
    export::{export_record, record_file_name},
    link::{Link, LinkConfig, LinkState, LogEntry, LogKind, LogObserver},
    protocol::{Command, Packet, ResultQuery, StreamReassembler, build_packet, validate_packet},
    transport::{DeviceEnd, MemoryTransport, Transport},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
