//! Interactive serial port selection.
//!
//! - Auto-selection of a single recognized USB-serial bridge
//! - Interactive selection via dialoguer
//! - Remembering selected bridges in configuration
//! - Non-interactive mode for scripts

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    meterlink::{DetectedPort, discover_ports, find_port_by_pattern, format_port_list},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not just recognized bridges.
    pub list_all_ports: bool,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Ask even when a single recognized port was found.
    pub confirm_port: bool,
}

/// Selected port and whether it matched a known bridge.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known or remembered device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match selection_ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = selection_ports
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("No serial ports available"))?;
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "Found multiple serial ports; pass --port to choose one in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Select a serial port from the CLI, the configuration, or the host.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.connection.port {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found; connect the instrument or pass --port",
        ));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config)
        },
        Ordering::Equal => {
            let Some(port) = selection_ports.into_iter().next() else {
                return Err(usage_err("No serial ports available"));
            };
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.bridge.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Interactive port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Port prompt failed: {io_err}")),
    }
}

/// Resolve a user-supplied port name against the detected ports.
///
/// Exact match, then case-insensitive match, then substring match
/// (`--port USB0`). Unknown names are used verbatim.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = discover_ports();

    let exact = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
        .cloned();
    let port = exact
        .or_else(|| find_port_by_pattern(name).ok())
        .unwrap_or_else(|| DetectedPort::plain(name));

    SelectedPort {
        is_known: port.bridge.is_known(),
        port,
    }
}

/// Check if a port matches a known bridge or a remembered USB device.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.bridge.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config.usb_device.iter().any(|d| d.matches(vid, pid)),
        _ => false,
    }
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Recognized USB-serial bridges are listed first").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_port_list(&ports)
        .into_iter()
        .zip(&ports)
        .map(|(label, port)| {
            let label = if is_known_device(port, config) {
                style(label).bold().to_string()
            } else {
                label
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the instrument's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let Some(index) = selection else {
        return Err(cancelled());
    };
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognized USB bridge for next time.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember USB device {vid:04X}:{pid:04X} for auto-detection?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::config::UsbDevice,
        meterlink::BridgeKind,
    };

    fn usb_port(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            bridge: BridgeKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::plain(name)
        }
    }

    fn assert_usage(err: &anyhow::Error) {
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_is_known_device_builtin_bridge() {
        let port = usb_port("/dev/ttyUSB0", 0x1A86, 0x7523);
        assert!(is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let port = usb_port("/dev/ttyUSB0", 0x9999, 0x9999);
        assert!(!is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_remembered() {
        let port = usb_port("/dev/ttyACM0", 0xABCD, 0x1234);
        let mut config = Config::default();
        config.usb_device.push(UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&port, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        let port = DetectedPort::plain("/dev/ttyS0");
        assert!(!is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_explicit_unknown_port_is_used_verbatim() {
        let selected = find_port_by_name("NOT_A_REAL_PORT_XYZ");
        assert_eq!(selected.port.name, "NOT_A_REAL_PORT_XYZ");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_explicit_port_wins_over_config() {
        let mut config = Config::default();
        config.connection.port = Some("CONFIGURED_PORT_XYZ".to_string());
        let options = SerialOptions {
            port: Some("EXPLICIT_PORT_XYZ".to_string()),
            ..Default::default()
        };
        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.port.name, "EXPLICIT_PORT_XYZ");
    }

    #[test]
    fn test_configured_port_used_without_prompt() {
        let mut config = Config::default();
        config.connection.port = Some("CONFIGURED_PORT_XYZ".to_string());
        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.port.name, "CONFIGURED_PORT_XYZ");
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyUSB0"),
            DetectedPort::plain("/dev/ttyUSB1"),
        ];
        let err = select_non_interactive_port(ports, &Config::default())
            .err()
            .expect("expected error");
        assert_usage(&err);
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .expect("expected error");
        assert_usage(&err);
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let ports = vec![usb_port("/dev/ttyUSB0", 0x10C4, 0xEA60)];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_truncated_label_fits_width() {
        let label = style("/dev/verylongttyusb0 [CP210x] - Very Long Product Name")
            .bold()
            .to_string();
        let truncated = console::truncate_str(&label, 26, "\u{2026}").into_owned();
        assert!(console::measure_text_width(&truncated) <= 26);
    }
}
