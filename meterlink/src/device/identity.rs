//! Device identification payload and model classification.
//!
//! ## Payload Layout
//!
//! ```text
//! +--------+------+-----------+---------+------------------+
//! | Family | Type | Serial no | HW ver  |     FW ver       |
//! +--------+------+-----------+---------+------------------+
//! | u16 LE |u16 LE|  u32 LE   | maj.min | maj.min.patch    |
//! | 2      | 2    |  4        | 2       | 3                |
//! +--------+------+-----------+---------+------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::str::FromStr;

/// Minimum identification payload length.
pub const DEVICE_INFO_LEN: usize = 13;

/// Known `(family, type)` pairs.
const MODEL_TABLE: &[(u16, u16, DeviceModel)] = &[
    (0x0010, 0x0001, DeviceModel::Mx200),
    (0x0010, 0x0002, DeviceModel::Mx200S),
    (0x0020, 0x0001, DeviceModel::Mx400),
    (0x0020, 0x0003, DeviceModel::Mx400Pro),
];

/// Instrument model classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceModel {
    /// MX-200 handheld meter.
    #[default]
    Mx200,
    /// MX-200S meter with storage extension.
    Mx200S,
    /// MX-400 bench instrument.
    Mx400,
    /// MX-400 Pro bench instrument.
    Mx400Pro,
    /// Family/type pair not in the model table.
    Unrecognized,
}

impl DeviceModel {
    /// Model name as printed on the instrument.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mx200 => "MX-200",
            Self::Mx200S => "MX-200S",
            Self::Mx400 => "MX-400",
            Self::Mx400Pro => "MX-400 Pro",
            Self::Unrecognized => "Unrecognized",
        }
    }

    /// Whether the model is in the table.
    pub fn is_recognized(self) -> bool {
        !matches!(self, Self::Unrecognized)
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "mx200" => Ok(Self::Mx200),
            "mx200s" => Ok(Self::Mx200S),
            "mx400" => Ok(Self::Mx400),
            "mx400pro" => Ok(Self::Mx400Pro),
            _ => Err(format!(
                "unknown device model '{s}' (expected MX-200, MX-200S, MX-400 or MX-400 Pro)"
            )),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceModel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Classify a `(family, type)` pair.
pub fn identify_device(family: u16, device_type: u16) -> DeviceModel {
    MODEL_TABLE
        .iter()
        .find(|(f, t, _)| *f == family && *t == device_type)
        .map_or(DeviceModel::Unrecognized, |(_, _, model)| *model)
}

/// Identity of the attached instrument, decoded from an `ID_GET` response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct DeviceIdentity {
    /// Classified model.
    pub model: DeviceModel,
    /// Serial number, eight decimal digits.
    pub serial_number: String,
    /// Hardware revision, `major.minor`.
    #[cfg_attr(feature = "serde", serde(rename = "hwVersion"))]
    pub hardware_version: String,
    /// Firmware version, `major.minor.patch`.
    #[cfg_attr(feature = "serde", serde(rename = "fwVersion"))]
    pub firmware_version: String,
    /// Family code.
    pub family: u16,
    /// Type code within the family.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub device_type: u16,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} S/N {} (HW {}, FW {})",
            self.model, self.serial_number, self.hardware_version, self.firmware_version
        )
    }
}

/// Decode an identification payload.
///
/// Returns `None` when the payload is shorter than [`DEVICE_INFO_LEN`].
/// Trailing bytes beyond the fixed layout are ignored.
pub fn parse_device_info(data: &[u8]) -> Option<DeviceIdentity> {
    if data.len() < DEVICE_INFO_LEN {
        return None;
    }

    let family = LittleEndian::read_u16(&data[0..2]);
    let device_type = LittleEndian::read_u16(&data[2..4]);
    let serial = LittleEndian::read_u32(&data[4..8]);

    Some(DeviceIdentity {
        model: identify_device(family, device_type),
        serial_number: format!("{serial:08}"),
        hardware_version: format!("{}.{}", data[8], data[9]),
        firmware_version: format!("{}.{}.{}", data[10], data[11], data[12]),
        family,
        device_type,
    })
}
