//! Instrument identity and host port discovery.

pub mod identity;
pub mod ports;

pub use identity::{DeviceIdentity, DeviceModel, identify_device, parse_device_info};
pub use ports::{
    BridgeKind, DetectedPort, discover_ports, find_port_by_pattern, format_port_list, select_port,
};
