//! Scripted instrument for tests.

use {
    crate::{
        protocol::{Command, Packet, ResultQuery, build_packet},
        transport::{DeviceControl, DeviceEnd},
    },
    std::sync::{Arc, Mutex},
};

/// Identification payload for `(family, type)` with fixed serial and versions.
pub(crate) fn identity_payload(family: u16, device_type: u16) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&family.to_le_bytes());
    data.extend_from_slice(&device_type.to_le_bytes());
    data.extend_from_slice(&20_240_101u32.to_le_bytes());
    data.extend_from_slice(&[1, 0, 2, 3, 4]);
    data
}

/// Let spawned tasks drain their queues.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

struct SimState {
    identity: Vec<u8>,
    measurements: Vec<Vec<Vec<u8>>>,
    silent: bool,
    chunk_size: Option<usize>,
    dropped: Option<(u16, u16)>,
    requests: Vec<Packet>,
}

pub(crate) struct SimDevice {
    state: SimState,
}

impl SimDevice {
    pub(crate) fn new(identity: Vec<u8>) -> Self {
        Self {
            state: SimState {
                identity,
                measurements: Vec::new(),
                silent: false,
                chunk_size: None,
                dropped: None,
                requests: Vec::new(),
            },
        }
    }

    /// Never answers anything.
    pub(crate) fn silent() -> Self {
        let mut device = Self::new(Vec::new());
        device.state.silent = true;
        device
    }

    /// Stored measurements, each a list of data packet payloads.
    pub(crate) fn with_measurements(mut self, measurements: Vec<Vec<Vec<u8>>>) -> Self {
        self.state.measurements = measurements;
        self
    }

    /// Deliver replies in chunks of `size` bytes.
    pub(crate) fn with_chunk_size(mut self, size: usize) -> Self {
        self.state.chunk_size = Some(size);
        self
    }

    /// Never answer the data request for `(measurement, packet)`.
    pub(crate) fn with_dropped_data(mut self, measurement: u16, packet: u16) -> Self {
        self.state.dropped = Some((measurement, packet));
        self
    }

    pub(crate) fn spawn(self, mut end: DeviceEnd) -> SimHandle {
        let state = Arc::new(Mutex::new(self.state));
        let control = end.control();
        let handle = SimHandle {
            state: Arc::clone(&state),
            control: control.clone(),
        };

        tokio::spawn(async move {
            while let Some(bytes) = end.next_write().await {
                let Ok(request) = Packet::decode(&bytes) else {
                    continue;
                };
                let (reply, chunk_size) = {
                    let mut state = state.lock().unwrap();
                    state.requests.push(request.clone());
                    (answer(&state, &request), state.chunk_size)
                };
                if let Some(reply) = reply {
                    let size = chunk_size.unwrap_or(reply.len()).max(1);
                    for chunk in reply.chunks(size) {
                        control.inject(chunk);
                    }
                }
            }
        });

        handle
    }
}

fn answer(state: &SimState, request: &Packet) -> Option<Vec<u8>> {
    if state.silent {
        return None;
    }
    let payload = match request.known_command()? {
        Command::IdGet => state.identity.clone(),
        Command::ResultGet => match ResultQuery::parse(&request.data)? {
            ResultQuery::Count => {
                let count = u16::try_from(state.measurements.len()).ok()?;
                count.to_le_bytes().to_vec()
            },
            ResultQuery::PacketCount { measurement } => {
                let packets = state.measurements.get(usize::from(measurement).checked_sub(1)?)?;
                vec![u8::try_from(packets.len()).ok()?]
            },
            ResultQuery::Data {
                measurement,
                packet,
            } => {
                if state.dropped == Some((measurement, packet)) {
                    return None;
                }
                state
                    .measurements
                    .get(usize::from(measurement).checked_sub(1)?)?
                    .get(usize::from(packet).checked_sub(1)?)?
                    .clone()
            },
        },
    };
    Some(build_packet(request.command, &payload))
}

pub(crate) struct SimHandle {
    state: Arc<Mutex<SimState>>,
    control: DeviceControl,
}

impl SimHandle {
    /// Every decoded request seen so far.
    pub(crate) fn requests(&self) -> Vec<Packet> {
        self.state.lock().unwrap().requests.clone()
    }

    pub(crate) fn set_identity(&self, identity: Vec<u8>) {
        self.state.lock().unwrap().identity = identity;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.control.connect_count()
    }

    /// Drop off the line as if unplugged.
    pub(crate) fn hang_up(&self) {
        self.control.hang_up();
    }
}
