//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns the host side, handed to a
//! [`Link`](crate::link::Link), and a [`DeviceEnd`] that plays the
//! instrument: it sees every byte the host writes and injects received
//! chunks with arbitrary fragmentation.

use {
    crate::{
        error::Result,
        transport::{ChunkSender, Transport},
    },
    log::debug,
    std::sync::{Arc, Mutex, MutexGuard},
    tokio::sync::mpsc,
};

#[derive(Debug)]
struct Pipe {
    incoming: Option<ChunkSender>,
    refuse: bool,
    connects: usize,
}

/// Host side of an in-memory link.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    pipe: Arc<Mutex<Pipe>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

/// Instrument side of an in-memory link.
#[derive(Debug)]
pub struct DeviceEnd {
    pipe: Arc<Mutex<Pipe>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MemoryTransport {
    /// Create a connected pair of endpoints.
    pub fn pair(name: impl Into<String>) -> (Self, DeviceEnd) {
        let pipe = Arc::new(Mutex::new(Pipe {
            incoming: None,
            refuse: false,
            connects: 0,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                pipe: Arc::clone(&pipe),
                written: tx,
            },
            DeviceEnd { pipe, written: rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, incoming: ChunkSender) -> Result<bool> {
        let mut pipe = lock(&self.pipe);
        if pipe.refuse {
            debug!("{}: connection refused", self.name);
            return Ok(false);
        }
        pipe.incoming = Some(incoming);
        pipe.connects += 1;
        Ok(true)
    }

    fn disconnect(&mut self) -> Result<()> {
        lock(&self.pipe).incoming = None;
        Ok(())
    }

    fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        if lock(&self.pipe).incoming.is_none() {
            return Err(
                std::io::Error::new(std::io::ErrorKind::NotConnected, "pipe closed").into(),
            );
        }
        self.written.send(bytes.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device end dropped")
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl DeviceEnd {
    /// Next write from the host, waiting for it. `None` once the host is gone.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Next write from the host, if one is already queued.
    pub fn try_next_write(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }

    /// Cloneable handle for injecting chunks and inspecting the pipe.
    pub fn control(&self) -> DeviceControl {
        DeviceControl {
            pipe: Arc::clone(&self.pipe),
        }
    }

    /// Deliver a chunk to the host. Returns `false` while disconnected.
    pub fn inject(&self, chunk: &[u8]) -> bool {
        self.control().inject(chunk)
    }

    /// Whether the host side currently holds the link open.
    pub fn is_connected(&self) -> bool {
        self.control().is_connected()
    }

    /// Make subsequent connect attempts report failure.
    pub fn refuse_connections(&self, refuse: bool) {
        self.control().refuse_connections(refuse);
    }
}

/// Shared control over the instrument side of a pipe.
#[derive(Debug, Clone)]
pub struct DeviceControl {
    pipe: Arc<Mutex<Pipe>>,
}

impl DeviceControl {
    /// Deliver a chunk to the host. Returns `false` while disconnected.
    pub fn inject(&self, chunk: &[u8]) -> bool {
        lock(&self.pipe)
            .incoming
            .as_ref()
            .is_some_and(|tx| tx.send(chunk.to_vec()).is_ok())
    }

    /// Whether the host side currently holds the link open.
    pub fn is_connected(&self) -> bool {
        lock(&self.pipe).incoming.is_some()
    }

    /// Make subsequent connect attempts report failure.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.pipe).refuse = refuse;
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.pipe).connects
    }

    /// Close the host's chunk stream without a host disconnect, the way an
    /// unplugged device ends a serial reader.
    pub fn hang_up(&self) {
        lock(&self.pipe).incoming = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::chunk_channel;

    #[test]
    fn test_write_reaches_device() {
        let (mut host, mut device) = MemoryTransport::pair("mem");
        let (tx, _rx) = chunk_channel();
        assert!(host.connect(tx).unwrap());
        host.send_binary(&[1, 2, 3]).unwrap();
        assert_eq!(device.try_next_write(), Some(vec![1, 2, 3]));
        assert_eq!(device.try_next_write(), None);
    }

    #[test]
    fn test_inject_reaches_host() {
        let (mut host, device) = MemoryTransport::pair("mem");
        let (tx, mut rx) = chunk_channel();
        assert!(!device.inject(&[9]));
        host.connect(tx).unwrap();
        assert!(device.inject(&[9, 8]));
        assert_eq!(rx.try_recv().unwrap(), vec![9, 8]);
    }

    #[test]
    fn test_disconnect_stops_traffic() {
        let (mut host, device) = MemoryTransport::pair("mem");
        let (tx, _rx) = chunk_channel();
        host.connect(tx).unwrap();
        host.disconnect().unwrap();
        host.disconnect().unwrap();
        assert!(!device.is_connected());
        assert!(host.send_binary(&[1]).is_err());
        assert!(!device.inject(&[1]));
    }

    #[test]
    fn test_hang_up_closes_chunk_stream() {
        let (mut host, device) = MemoryTransport::pair("mem");
        let (tx, mut rx) = chunk_channel();
        host.connect(tx).unwrap();
        device.control().hang_up();
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
        assert!(!device.inject(&[1]));
    }

    #[test]
    fn test_refused_connect() {
        let (mut host, device) = MemoryTransport::pair("mem");
        device.refuse_connections(true);
        let (tx, _rx) = chunk_channel();
        assert!(!host.connect(tx).unwrap());
        assert_eq!(device.control().connect_count(), 0);
        assert_eq!(host.name(), "mem");
    }
}
