//! Connection handshake and request/response correlation.
//!
//! A [`Link`] owns everything that changes while talking to the instrument:
//! the reassembly buffer, the single pending-request slot, the handshake
//! slot, the link state and the last decoded identity. All of it lives in
//! one mutex-guarded struct. Received chunks are dispatched synchronously,
//! one chunk at a time, by a pump task reading the transport's chunk channel.
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> Opening -> AwaitingIdentity -> Verified
//!       ^                            |
//!       +-------- Rejected <---------+
//! ```
//!
//! Only `Verified` accepts requests and sends.
//!
//! ## Correlation
//!
//! Responses are matched to the outstanding request by command code alone;
//! the wire format carries no transaction tag. A late response to an earlier
//! request of the same command would be attributed to the current one.

pub mod events;

use {
    crate::{
        device::{DeviceIdentity, DeviceModel, parse_device_info},
        error::{Error, Result},
        protocol::{
            Candidate, Command, Packet, StreamReassembler, build_packet,
            packet::command_label, reassembler::DEFAULT_MAX_PAYLOAD_LEN,
        },
        transport::{ChunkReceiver, Transport, chunk_channel, text_preview},
    },
    log::{debug, error, info, trace, warn},
    std::{
        fmt, mem,
        ops::{Deref, DerefMut},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::{sync::oneshot, task::JoinHandle},
};

pub use events::{LogEntry, LogKind, LogObserver, hex_dump};

/// Default wait for the identification response.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default wait for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No transport open.
    #[default]
    Disconnected,
    /// Transport connect in progress.
    Opening,
    /// Identification request sent, waiting for the answer.
    AwaitingIdentity,
    /// Device identified as the accepted model.
    Verified,
    /// Handshake failed; teardown follows.
    Rejected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Opening => "opening",
            Self::AwaitingIdentity => "awaiting identity",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Link settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The only model the handshake accepts.
    pub target_model: DeviceModel,
    /// Wait for the identification response.
    pub handshake_timeout: Duration,
    /// Wait used by [`Link::identify`].
    pub request_timeout: Duration,
    /// Largest payload a received header may declare.
    pub max_payload_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target_model: DeviceModel::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl LinkConfig {
    /// Set the accepted model.
    #[must_use]
    pub fn with_target_model(mut self, model: DeviceModel) -> Self {
        self.target_model = model;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the payload ceiling of the reassembler.
    #[must_use]
    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

struct PendingRequest {
    id: u64,
    expected: u8,
    reply: Reply<Vec<u8>>,
}

struct Shared {
    state: LinkState,
    target_model: DeviceModel,
    reassembler: StreamReassembler,
    pending: Option<PendingRequest>,
    handshake: Option<Reply<DeviceIdentity>>,
    identity: Option<DeviceIdentity>,
    observer: Option<LogObserver>,
    outbox: Vec<LogEntry>,
    session: u64,
    next_id: u64,
}

impl Shared {
    /// Log an event; observers see it once the lock is released.
    fn emit(&mut self, kind: LogKind, message: String, raw: Option<Vec<u8>>) {
        match kind {
            LogKind::Tx | LogKind::Rx => trace!("{kind}: {message}"),
            LogKind::Info | LogKind::Success => info!("{message}"),
            LogKind::Warning => warn!("{message}"),
            LogKind::Error => error!("{message}"),
        }
        if self.observer.is_some() {
            self.outbox.push(LogEntry::now(kind, message, raw));
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link state: {} -> {state}", self.state);
            self.state = state;
        }
    }

    /// Reject every waiter and forget the session.
    fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(Error::Disconnected));
        }
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.send(Err(Error::Disconnected));
        }
        self.identity = None;
        self.reassembler.clear();
        self.set_state(LinkState::Disconnected);
    }

    fn handle_chunk(&mut self, chunk: &[u8]) {
        self.emit(
            LogKind::Rx,
            format!("{} | {}", hex_dump(chunk), text_preview(chunk)),
            Some(chunk.to_vec()),
        );

        for candidate in self.reassembler.extract(chunk) {
            match candidate {
                Candidate::Packet(packet) => self.route(packet),
                Candidate::Corrupt { bytes } => self.emit(
                    LogKind::Error,
                    format!("Discarded {} byte packet with bad checksum", bytes.len()),
                    Some(bytes),
                ),
                Candidate::Overflow { declared, limit } => self.emit(
                    LogKind::Error,
                    Error::FramingOverflow { declared, limit }.to_string(),
                    None,
                ),
            }
        }
    }

    fn route(&mut self, packet: Packet) {
        let id_get = u8::from(Command::IdGet);

        if self.state == LinkState::AwaitingIdentity && packet.command == id_get {
            if let Some(reply) = self.handshake.take() {
                let outcome = self.verify(&packet.data);
                let _ = reply.send(outcome);
                return;
            }
        }

        if let Some(pending) = self
            .pending
            .take_if(|pending| pending.expected == packet.command)
        {
            debug!(
                "Response {} settles request #{}",
                command_label(packet.command),
                pending.id
            );
            let _ = pending.reply.send(Ok(packet.data));
            return;
        }

        self.emit(
            LogKind::Warning,
            format!(
                "Unsolicited packet {} with {} byte payload",
                command_label(packet.command),
                packet.data.len()
            ),
            Some(packet.encode()),
        );
    }

    fn verify(&mut self, data: &[u8]) -> Result<DeviceIdentity> {
        let Some(identity) = parse_device_info(data) else {
            self.set_state(LinkState::Rejected);
            let err = Error::Protocol(format!(
                "identification payload too short ({} bytes)",
                data.len()
            ));
            self.emit(LogKind::Error, err.to_string(), Some(data.to_vec()));
            return Err(err);
        };

        if identity.model != self.target_model {
            self.set_state(LinkState::Rejected);
            let err = Error::UnexpectedModel {
                expected: self.target_model.to_string(),
                actual: identity.model.to_string(),
            };
            self.emit(LogKind::Error, err.to_string(), None);
            return Err(err);
        }

        self.emit(LogKind::Success, format!("Connected to {identity}"), None);
        self.identity = Some(identity.clone());
        self.set_state(LinkState::Verified);
        Ok(identity)
    }
}

/// Guard over [`Shared`] that hands queued log entries to the observer
/// after unlocking.
struct SharedGuard<'a>(Option<MutexGuard<'a, Shared>>);

impl Deref for SharedGuard<'_> {
    type Target = Shared;

    fn deref(&self) -> &Shared {
        self.0.as_deref().unwrap_or_else(|| unreachable!("guard used after drop"))
    }
}

impl DerefMut for SharedGuard<'_> {
    fn deref_mut(&mut self) -> &mut Shared {
        self.0
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("guard used after drop"))
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let Some(mut guard) = self.0.take() else {
            return;
        };
        let entries = mem::take(&mut guard.outbox);
        let observer = guard.observer.clone();
        drop(guard);
        if let Some(observer) = observer {
            for entry in &entries {
                observer(entry);
            }
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> SharedGuard<'_> {
    SharedGuard(Some(shared.lock().unwrap_or_else(PoisonError::into_inner)))
}

/// Protocol session over one transport.
///
/// Methods take `&self`; the link can be shared between tasks, but requests
/// must still be issued one at a time.
pub struct Link<T: Transport> {
    config: LinkConfig,
    name: String,
    transport: Mutex<T>,
    shared: Arc<Mutex<Shared>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Link<T> {
    /// Create a disconnected link.
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let shared = Shared {
            state: LinkState::Disconnected,
            target_model: config.target_model,
            reassembler: StreamReassembler::new(config.max_payload_len),
            pending: None,
            handshake: None,
            identity: None,
            observer: None,
            outbox: Vec::new(),
            session: 0,
            next_id: 0,
        };
        Self {
            name: transport.name().to_string(),
            config,
            transport: Mutex::new(transport),
            shared: Arc::new(Mutex::new(shared)),
            pump: Mutex::new(None),
        }
    }

    /// Register the log event callback.
    pub fn set_log_observer(&self, observer: LogObserver) {
        lock(&self.shared).observer = Some(observer);
    }

    /// Settings in use.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        lock(&self.shared).state
    }

    /// Whether requests are allowed.
    pub fn is_verified(&self) -> bool {
        self.state() == LinkState::Verified
    }

    /// Identity from the last successful identification.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.shared).identity.clone()
    }

    /// Feed received bytes through reassembly and dispatch.
    ///
    /// Called by the pump for every chunk; exposed for transports that
    /// deliver bytes by other means.
    pub fn handle_chunk(&self, chunk: &[u8]) {
        lock(&self.shared).handle_chunk(chunk);
    }

    fn transport(&self) -> MutexGuard<'_, T> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: LogKind, message: String) {
        lock(&self.shared).emit(kind, message, None);
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        lock(&self.shared).emit(LogKind::Tx, hex_dump(bytes), Some(bytes.to_vec()));
        self.transport().send_binary(bytes)
    }

    fn ensure_verified(&self) -> Result<()> {
        if self.is_verified() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Dispatch chunks until the transport closes the channel.
    ///
    /// A channel closing under a live session (reader died, device unplugged)
    /// rejects every waiter and marks the link disconnected.
    fn start_pump(&self, mut incoming: ChunkReceiver, session: u64) {
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            while let Some(chunk) = incoming.recv().await {
                lock(&shared).handle_chunk(&chunk);
            }
            let mut shared = lock(&shared);
            if shared.session == session && shared.state != LinkState::Disconnected {
                shared.emit(LogKind::Error, format!("Lost connection to {name}"), None);
                shared.reset();
            } else {
                trace!("Chunk channel closed");
            }
        });
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Open the transport and run the identification handshake.
    ///
    /// Resolves with the identity once the device answers as the accepted
    /// model. A different model, a malformed answer or silence past the
    /// handshake timeout tears the transport down again.
    pub async fn connect(&self) -> Result<DeviceIdentity> {
        let session = {
            let mut shared = lock(&self.shared);
            if shared.state != LinkState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            shared.session += 1;
            shared.identity = None;
            shared.reassembler.clear();
            shared.set_state(LinkState::Opening);
            shared.emit(LogKind::Info, format!("Connecting to {}", self.name), None);
            shared.session
        };

        // A session lost to a dead reader leaves the transport half open.
        self.stop_pump();
        if let Err(e) = self.transport().disconnect() {
            warn!("Transport disconnect failed: {e}");
        }

        let (tx, rx) = chunk_channel();
        let opened = self.transport().connect(tx);
        match opened {
            Ok(true) => {},
            Ok(false) => {
                lock(&self.shared).set_state(LinkState::Disconnected);
                self.emit(LogKind::Error, format!("Could not connect to {}", self.name));
                return Err(Error::ConnectFailed(self.name.clone()));
            },
            Err(e) => {
                lock(&self.shared).set_state(LinkState::Disconnected);
                self.emit(LogKind::Error, format!("Could not connect to {}: {e}", self.name));
                return Err(e);
            },
        }
        self.start_pump(rx, session);

        let (reply, mut outcome) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            shared.handshake = Some(reply);
            shared.set_state(LinkState::AwaitingIdentity);
        }

        let result = match self.write(&build_packet(Command::IdGet.into(), &[])) {
            Ok(()) => {
                match tokio::time::timeout(self.config.handshake_timeout, &mut outcome).await {
                    Ok(settled) => settled.unwrap_or(Err(Error::Disconnected)),
                    Err(_) => self.handshake_timed_out(&mut outcome),
                }
            },
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.teardown();
        }
        result
    }

    fn handshake_timed_out(
        &self,
        outcome: &mut oneshot::Receiver<Result<DeviceIdentity>>,
    ) -> Result<DeviceIdentity> {
        let mut shared = lock(&self.shared);
        if shared.handshake.take().is_some() {
            shared.set_state(LinkState::Rejected);
            let ms = u64::try_from(self.config.handshake_timeout.as_millis()).unwrap_or(u64::MAX);
            let err = Error::HandshakeTimeout(ms);
            shared.emit(LogKind::Error, err.to_string(), None);
            return Err(err);
        }
        // Dispatch settled the slot as the timer fired.
        outcome.try_recv().unwrap_or(Err(Error::Disconnected))
    }

    fn teardown(&self) {
        lock(&self.shared).reset();
        self.stop_pump();
        if let Err(e) = self.transport().disconnect() {
            warn!("Transport disconnect failed: {e}");
        }
    }

    /// Close the transport and reject anything still waiting.
    pub fn disconnect(&self) -> Result<()> {
        let was = self.state();
        lock(&self.shared).reset();
        self.stop_pump();
        let result = self.transport().disconnect();
        if was != LinkState::Disconnected {
            self.emit(LogKind::Info, format!("Disconnected from {}", self.name));
        }
        result
    }

    /// Send `command` with `data` and wait for the next packet whose command
    /// is `expected`.
    ///
    /// Only one request may be outstanding; a second one fails with
    /// [`Error::RequestInFlight`] without touching the first. The slot is
    /// free again once this returns, whatever the outcome.
    pub async fn request(
        &self,
        command: u8,
        data: &[u8],
        expected: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (reply, mut response) = oneshot::channel();
        let id = {
            let mut shared = lock(&self.shared);
            if shared.state != LinkState::Verified {
                return Err(Error::NotConnected);
            }
            if let Some(pending) = &shared.pending {
                return Err(Error::RequestInFlight(pending.expected));
            }
            shared.next_id += 1;
            let id = shared.next_id;
            shared.pending = Some(PendingRequest {
                id,
                expected,
                reply,
            });
            id
        };

        if let Err(e) = self.write(&build_packet(command, data)) {
            self.release(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(settled) => settled.unwrap_or(Err(Error::Disconnected)),
            Err(_) => {
                if self.release(id) {
                    let err = Error::RequestTimeout { command: expected };
                    self.emit(LogKind::Warning, err.to_string());
                    Err(err)
                } else {
                    // Dispatch settled the slot as the timer fired.
                    response.try_recv().unwrap_or(Err(Error::Disconnected))
                }
            },
        }
    }

    /// Free the pending slot if it still belongs to request `id`.
    fn release(&self, id: u64) -> bool {
        lock(&self.shared)
            .pending
            .take_if(|pending| pending.id == id)
            .is_some()
    }

    /// Query the identity again and replace the stored one.
    pub async fn identify(&self) -> Result<DeviceIdentity> {
        let id_get = u8::from(Command::IdGet);
        let data = self
            .request(id_get, &[], id_get, self.config.request_timeout)
            .await?;
        let identity = parse_device_info(&data).ok_or_else(|| {
            Error::Protocol(format!(
                "identification payload too short ({} bytes)",
                data.len()
            ))
        })?;

        let mut shared = lock(&self.shared);
        shared.emit(LogKind::Success, format!("Identified {identity}"), None);
        shared.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Send a packet without waiting for a response.
    pub fn send_command(&self, command: u8, data: &[u8]) -> Result<()> {
        self.ensure_verified()?;
        self.write(&build_packet(command, data))
    }

    /// Send bytes as-is.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_verified()?;
        self.write(bytes)
    }
}

impl<T: Transport> Drop for Link<T> {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
