//! Identify, send and raw command implementations.

use {
    crate::{Cli, block_on, config::Config, open_link},
    anyhow::{Context, Result},
    console::style,
    meterlink::{
        DeviceIdentity, LogEntry, LogKind,
        link::{DEFAULT_REQUEST_TIMEOUT, hex_dump},
        protocol::packet::command_label,
    },
    std::{sync::Arc, time::Duration},
};

/// Identify command implementation.
pub(crate) fn cmd_identify(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let link = open_link(cli, config)?;

    let identity = block_on(async move {
        let identity = link.connect().await?;
        link.disconnect()?;
        Ok::<_, meterlink::Error>(identity)
    })?
    .context("Handshake failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&identity)?);
    } else {
        print_identity(&identity);
    }
    Ok(())
}

fn print_identity(identity: &DeviceIdentity) {
    eprintln!("\n{}", style("Instrument").bold().underlined());
    eprintln!("  {:<16} {}", "Model:", style(identity.model).green().bold());
    eprintln!("  {:<16} {}", "Serial number:", identity.serial_number);
    eprintln!("  {:<16} {}", "Hardware:", identity.hardware_version);
    eprintln!("  {:<16} {}", "Firmware:", identity.firmware_version);
    eprintln!(
        "  {:<16} family 0x{:04X}, type 0x{:04X}",
        "Codes:", identity.family, identity.device_type
    );
}

/// Send command implementation.
///
/// With `expect`, waits for the matching response and prints its payload as
/// hex on stdout.
pub(crate) fn cmd_send(
    cli: &Cli,
    config: &mut Config,
    command: u8,
    data: &[u8],
    expect: Option<u8>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .or_else(|| config.request_timeout())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
    let link = open_link(cli, config)?;
    let payload = data.to_vec();

    let response = block_on(async move {
        link.connect().await?;
        let response = match expect {
            Some(expected) => Some(link.request(command, &payload, expected, timeout).await?),
            None => {
                link.send_command(command, &payload)?;
                None
            },
        };
        link.disconnect()?;
        Ok::<_, meterlink::Error>(response)
    })?
    .with_context(|| format!("{} failed", command_label(command)))?;

    if json {
        let output = serde_json::json!({
            "command": command,
            "data": hex_dump(data),
            "expect": expect,
            "response": response.as_deref().map(hex_dump),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "{} Sent {} with {} payload bytes",
            style("✓").green(),
            command_label(command),
            data.len()
        );
    }
    if let Some(response) = response {
        if !cli.quiet {
            eprintln!(
                "{} Response: {} payload bytes",
                style("✓").green(),
                response.len()
            );
        }
        println!("{}", hex_dump(&response));
    }
    Ok(())
}

/// Raw command implementation.
///
/// Sends `bytes` unframed after the handshake, then shows every received
/// chunk and framing event for `listen_ms`.
pub(crate) fn cmd_raw(cli: &Cli, config: &mut Config, bytes: &[u8], listen_ms: u64) -> Result<()> {
    let link = open_link(cli, config)?;
    let bytes = bytes.to_vec();
    let quiet = cli.quiet;

    block_on(async move {
        link.connect().await?;
        link.set_log_observer(Arc::new(move |entry: &LogEntry| {
            if shows_in_raw_session(entry.kind, quiet) {
                eprintln!("{entry}");
            }
        }));
        link.send_raw(&bytes)?;
        tokio::time::sleep(Duration::from_millis(listen_ms)).await;
        link.disconnect()
    })?
    .context("Raw exchange failed")?;

    Ok(())
}

fn shows_in_raw_session(kind: LogKind, quiet: bool) -> bool {
    match kind {
        LogKind::Tx | LogKind::Rx | LogKind::Warning | LogKind::Error => true,
        LogKind::Info | LogKind::Success => !quiet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_session_shows_traffic_even_when_quiet() {
        for kind in [LogKind::Tx, LogKind::Rx, LogKind::Warning, LogKind::Error] {
            assert!(shows_in_raw_session(kind, true));
        }
        assert!(!shows_in_raw_session(LogKind::Info, true));
        assert!(shows_in_raw_session(LogKind::Success, false));
    }
}
