//! Link log events for UIs.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Arc;

/// Category of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LogKind {
    /// General progress.
    Info,
    /// Bytes written to the transport.
    Tx,
    /// Bytes received from the transport.
    Rx,
    /// Completed step.
    Success,
    /// Failure.
    Error,
    /// Recoverable anomaly.
    Warning,
}

impl LogKind {
    /// Short lowercase tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Tx => "tx",
            Self::Rx => "rx",
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the event happened.
    pub timestamp: DateTime<Local>,
    /// Human-readable message.
    pub message: String,
    /// Category.
    pub kind: LogKind,
    /// Bytes involved, for tx/rx and discarded packets.
    pub raw: Option<Vec<u8>>,
}

impl LogEntry {
    /// Entry stamped with the current time.
    pub fn now(kind: LogKind, message: impl Into<String>, raw: Option<Vec<u8>>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
            kind,
            raw,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:>7} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.kind,
            self.message
        )
    }
}

/// Callback receiving every log event of a link.
///
/// Invoked synchronously on the thread that produced the events, after the
/// link's internal lock is released, so it may query the link.
pub type LogObserver = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Space-separated uppercase hex.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
