//! Serial port discovery and USB bridge classification.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, trace};

/// Known USB-to-serial bridges found in instrument cables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown bridge or not a USB port.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        BridgeKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], BridgeKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        BridgeKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| {
                vid == *known_vid && (pids.is_empty() || pids.contains(&pid))
            })
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable bridge name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges shipped in the instrument's own cables, preferred on auto-selection.
    pub fn is_preferred(&self) -> bool {
        matches!(self, Self::Cp210x | Self::Ftdi)
    }
}

/// A serial port found on the host.
///
/// With the `serde` feature it serializes flat, the bridge as its display
/// name plus a `known` flag.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge kind.
    pub bridge: BridgeKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

#[cfg(feature = "serde")]
impl serde::Serialize for DetectedPort {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut port = serializer.serialize_struct("DetectedPort", 8)?;
        port.serialize_field("name", &self.name)?;
        port.serialize_field("bridge", self.bridge.name())?;
        port.serialize_field("known", &self.bridge.is_known())?;
        port.serialize_field("vid", &self.vid)?;
        port.serialize_field("pid", &self.pid)?;
        port.serialize_field("manufacturer", &self.manufacturer)?;
        port.serialize_field("product", &self.product)?;
        port.serialize_field("serial", &self.serial)?;
        port.end()
    }
}

impl DetectedPort {
    /// A port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: BridgeKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether this port sits behind a recognized USB bridge.
    pub fn is_usb_bridge(&self) -> bool {
        self.bridge.is_known()
    }
}

/// Enumerate serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn discover_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|port_info| {
            let mut detected = DetectedPort::plain(port_info.port_name.clone());
            if let serialport::SerialPortType::UsbPort(usb) = port_info.port_type {
                detected.bridge = BridgeKind::from_vid_pid(usb.vid, usb.pid);
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;

                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Bridge: {:?})",
                    port_info.port_name, usb.vid, usb.pid, detected.bridge
                );
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no native serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate from `ports`.
///
/// Preference: instrument cable bridges, then any known bridge, then the
/// first port listed.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports.iter().find(|p| p.bridge.is_preferred()) {
        return Ok(port.clone());
    }
    if let Some(port) = ports.iter().find(|p| p.bridge.is_known()) {
        return Ok(port.clone());
    }
    ports.into_iter().next().ok_or(Error::DeviceNotFound)
}

/// Find a port whose name contains `pattern`.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    discover_ports()
        .into_iter()
        .find(|p| p.name.contains(pattern))
        .ok_or(Error::DeviceNotFound)
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let bridge = if port.bridge.is_known() {
                format!(" [{}]", port.bridge.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{bridge}{product}", port.name)
        })
        .collect()
}
