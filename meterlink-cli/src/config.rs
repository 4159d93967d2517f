//! Configuration file support for meterlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (METERLINK_*)
//! 3. Local config file (./meterlink.toml)
//! 4. Global config file (~/.config/meterlink/config.toml)
//!
//! USB bridges the user chose to remember live in a separate ports file
//! (./meterlink_ports.toml or ~/.config/meterlink/ports.toml).

use {
    anyhow::{Context, Result},
    directories::ProjectDirs,
    log::{debug, info, warn},
    meterlink::DeviceModel,
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

const LOCAL_CONFIG: &str = "meterlink.toml";
const LOCAL_PORTS: &str = "meterlink_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// `[device]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Model the handshake must find (e.g. "MX-200").
    pub target_model: Option<String>,
    /// Handshake wait in milliseconds.
    pub handshake_timeout_ms: Option<u64>,
    /// Largest payload a received packet header may declare.
    pub max_payload_len: Option<usize>,
}

/// `[download]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Per-request wait in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Pause between data packet requests in milliseconds.
    pub throttle_ms: Option<u64>,
    /// Directory for exported measurement files.
    pub output_dir: Option<PathBuf>,
}

/// Remembered USB bridges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Handshake settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Bulk download settings.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Remembered USB bridges (loaded from the ports file).
    #[serde(default, skip_serializing)]
    pub usb_device: Vec<UsbDevice>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports) = Self::load_ports_config() {
            config.usb_device = ports.usb_device;
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_ports_config() -> Option<PortsConfig> {
        let candidates = [
            Some(PathBuf::from(LOCAL_PORTS)),
            Self::global_config_dir().map(|dir| dir.join("ports.toml")),
        ];
        candidates.into_iter().flatten().find_map(|path| {
            let content = fs::read_to_string(&path).ok()?;
            let ports = toml::from_str(&content).ok()?;
            debug!("Loaded ports config from {}", path.display());
            Some(ports)
        })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "meterlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        if other.device.target_model.is_some() {
            self.device.target_model = other.device.target_model;
        }
        if other.device.handshake_timeout_ms.is_some() {
            self.device.handshake_timeout_ms = other.device.handshake_timeout_ms;
        }
        if other.device.max_payload_len.is_some() {
            self.device.max_payload_len = other.device.max_payload_len;
        }

        if other.download.request_timeout_ms.is_some() {
            self.download.request_timeout_ms = other.download.request_timeout_ms;
        }
        if other.download.throttle_ms.is_some() {
            self.download.throttle_ms = other.download.throttle_ms;
        }
        if other.download.output_dir.is_some() {
            self.download.output_dir = other.download.output_dir;
        }

        self.usb_device.extend(other.usb_device);
    }

    /// Configured target model, if any.
    pub fn target_model(&self) -> Result<Option<DeviceModel>> {
        self.device
            .target_model
            .as_deref()
            .map(|name| {
                name.parse::<DeviceModel>()
                    .map_err(anyhow::Error::msg)
                    .context("Invalid [device] target_model in configuration")
            })
            .transpose()
    }

    /// Configured handshake timeout.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.device.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Configured request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.download.request_timeout_ms.map(Duration::from_millis)
    }

    /// Configured throttle.
    pub fn throttle(&self) -> Option<Duration> {
        self.download.throttle_ms.map(Duration::from_millis)
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> Result<()> {
        let device = UsbDevice { vid, pid };

        if self.usb_device.contains(&device) {
            return Ok(());
        }

        // Local ports file when working in a configured directory, global otherwise.
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.usb_device.push(device);

        let ports = PortsConfig {
            usb_device: self.usb_device.clone(),
        };
        let content = toml::to_string_pretty(&ports)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
