//! Port listing command implementation.

use {
    anyhow::Result,
    console::style,
    meterlink::{discover_ports, select_port},
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&detected)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let bridge = if port.bridge.is_known() {
            format!(" [{}]", style(port.bridge.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{bridge}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(best) = select_port(detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        meterlink::{BridgeKind, DetectedPort},
    };

    #[test]
    fn test_port_serializes_flat() {
        let port = DetectedPort {
            bridge: BridgeKind::Cp210x,
            vid: Some(0x10C4),
            pid: Some(0xEA60),
            product: Some("CP2102 USB to UART".to_string()),
            ..DetectedPort::plain("/dev/ttyUSB0")
        };
        let value = serde_json::to_value(&port).unwrap();
        assert_eq!(value["name"], "/dev/ttyUSB0");
        assert_eq!(value["bridge"], "CP210x");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x10C4);
        assert!(value["serial"].is_null());
    }

    #[test]
    fn test_plain_port_serializes_nulls() {
        let value = serde_json::to_value(DetectedPort::plain("COM1")).unwrap();
        assert_eq!(value["bridge"], "Unknown");
        assert_eq!(value["known"], false);
        assert!(value["vid"].is_null());
    }
}
