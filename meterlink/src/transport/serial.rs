//! Native serial transport using the `serialport` crate.

use {
    crate::{
        error::Result,
        transport::{ChunkSender, Transport},
    },
    log::{debug, trace, warn},
    std::{
        io::{ErrorKind, Read, Write},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::JoinHandle,
        time::Duration,
    },
};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Poll interval of the background reader.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    /// Create a configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the reader poll interval.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Serial port transport.
///
/// Received bytes are read on a background thread from a cloned handle and
/// forwarded chunk by chunk.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Create a transport; the port is opened on [`Transport::connect`].
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

fn read_loop(
    mut reader: Box<dyn serialport::SerialPort>,
    incoming: ChunkSender,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                trace!("Serial read {n} bytes");
                if incoming.send(buf[..n].to_vec()).is_err() {
                    debug!("Chunk receiver dropped, stopping reader");
                    break;
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
            Err(e) => {
                warn!("Serial read failed: {e}");
                break;
            },
        }
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self, incoming: ChunkSender) -> Result<bool> {
        if self.port.is_some() {
            return Ok(true);
        }

        debug!(
            "Opening {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;

        let reader = port.try_clone()?;
        self.stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop);
        self.reader = Some(std::thread::spawn(move || read_loop(reader, incoming, stop)));
        self.port = Some(port);
        Ok(true)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Serial reader thread panicked");
            }
        }
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotConnected, "serial port closed")
        })?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
