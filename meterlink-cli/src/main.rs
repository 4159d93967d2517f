//! meterlink CLI - Command-line tool for MX-series measurement instruments.
//!
//! ## Features
//!
//! - Identify the attached instrument (model, serial number, versions)
//! - Download every stored measurement to disk
//! - Send individual protocol commands or raw bytes for diagnostics
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    meterlink::{
        Command as ProtocolCommand, DeviceModel, Link, LinkConfig, SerialConfig, SerialTransport,
        protocol::parse_hex_bytes,
    },
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use {
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Baud rate used when neither the CLI nor the config names one.
const DEFAULT_BAUD: u32 = 115_200;

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed run: 2 usage, 130 cancelled, 1 anything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => return 2,
        Some(CliError::Cancelled(_)) => return 130,
        None => {},
    }
    match err.downcast_ref::<meterlink::Error>() {
        Some(meterlink::Error::Interrupted) => 130,
        _ => 1,
    }
}

/// meterlink - Identify measurement instruments and download their stored results.
///
/// Environment variables:
///   METERLINK_PORT              - Default serial port
///   METERLINK_BAUD              - Default baud rate (default: 115200)
///   METERLINK_MODEL             - Expected instrument model (default: MX-200)
///   METERLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "meterlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "METERLINK_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "METERLINK_BAUD")]
    baud: Option<u32>,

    /// Instrument model the handshake must find (MX-200, MX-200S, MX-400, MX-400 Pro).
    #[arg(short, long, global = true, env = "METERLINK_MODEL")]
    model: Option<DeviceModel>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "METERLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Bytes given on the command line as hex text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Connect, run the handshake and show the instrument identity.
    Identify {
        /// Output the identity as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Send one protocol command.
    Send {
        /// Command name (ID_GET, RESULT_GET) or byte (e.g. 0x20).
        #[arg(value_parser = parse_command_arg)]
        command: u8,

        /// Payload as hex (e.g. "02 01 00 01 00").
        #[arg(value_parser = parse_hex_arg)]
        data: Option<HexBytes>,

        /// Wait for a response packet with this command and print its payload.
        #[arg(long, value_parser = parse_command_arg)]
        expect: Option<u8>,

        /// Response timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output the exchange as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Send raw bytes without framing and show what comes back.
    Raw {
        /// Bytes as hex (e.g. "01 00 00 00 00").
        #[arg(value_parser = parse_hex_arg)]
        bytes: HexBytes,

        /// How long to listen for incoming data, in milliseconds.
        #[arg(long, default_value_t = 500)]
        listen_ms: u64,
    },

    /// Download every stored measurement.
    Download {
        /// Output directory for measurement files.
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Pause between data packet requests in milliseconds.
        #[arg(long)]
        throttle_ms: Option<u64>,

        /// Per-request timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a command given by protocol name or as a byte.
fn parse_command_arg(s: &str) -> Result<u8, String> {
    let s = s.trim();
    if let Some(command) = ProtocolCommand::from_name(s) {
        return Ok(command.into());
    }
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16)
        .map_err(|_| format!("'{s}' is not a command name (ID_GET, RESULT_GET) or a hex byte"))
}

fn parse_hex_arg(s: &str) -> Result<HexBytes, String> {
    parse_hex_bytes(s)
        .map(HexBytes)
        .map_err(|e| e.to_string())
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "meterlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Identify { json } => commands::device::cmd_identify(&cli, &mut config, *json),
        Commands::Send {
            command,
            data,
            expect,
            timeout_ms,
            json,
        } => {
            let data = data.as_ref().map_or(&[][..], |d| d.0.as_slice());
            commands::device::cmd_send(
                &cli,
                &mut config,
                *command,
                data,
                *expect,
                *timeout_ms,
                *json,
            )
        },
        Commands::Raw { bytes, listen_ms } => {
            commands::device::cmd_raw(&cli, &mut config, &bytes.0, *listen_ms)
        },
        Commands::Download {
            out,
            throttle_ms,
            timeout_ms,
        } => commands::download::cmd_download(
            &cli,
            &mut config,
            out.as_ref(),
            *throttle_ms,
            *timeout_ms,
        ),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: meterlink completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Route Ctrl-C into the library's interruption check.
fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    meterlink::set_interrupt_checker(was_interrupted);
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Link settings from the CLI, falling back to the config file.
fn link_config(cli: &Cli, config: &Config) -> Result<LinkConfig> {
    let mut link_config = LinkConfig::default();
    let model = match cli.model {
        Some(model) => Some(model),
        None => config.target_model()?,
    };
    if let Some(model) = model {
        link_config = link_config.with_target_model(model);
    }
    if let Some(timeout) = config.handshake_timeout() {
        link_config = link_config.with_handshake_timeout(timeout);
    }
    if let Some(timeout) = config.request_timeout() {
        link_config = link_config.with_request_timeout(timeout);
    }
    if let Some(len) = config.device.max_payload_len {
        link_config = link_config.with_max_payload_len(len);
    }
    Ok(link_config)
}

/// Select a port and build an unconnected link on it.
fn open_link(cli: &Cli, config: &mut Config) -> Result<Link<SerialTransport>> {
    let link_config = link_config(cli, config)?;
    let port = get_port(cli, config)?;
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);

    if !cli.quiet {
        eprintln!(
            "{} Using {} @ {} baud, expecting {}",
            style("🔌").cyan(),
            style(&port).green(),
            baud,
            style(link_config.target_model).yellow()
        );
    }

    let transport = SerialTransport::new(SerialConfig::new(port, baud));
    Ok(Link::new(transport, link_config))
}

/// Run `future` to completion on a fresh runtime.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod cli_tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_identify() {
        let cli = Cli::try_parse_from(["meterlink", "identify"]).unwrap();
        assert!(matches!(cli.command, Commands::Identify { json: false }));

        let cli = Cli::try_parse_from(["meterlink", "identify", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Identify { json: true }));
    }

    #[test]
    fn test_cli_parse_send_by_name() {
        let cli = Cli::try_parse_from([
            "meterlink",
            "send",
            "RESULT_GET",
            "02 01 00 01 00",
            "--expect",
            "result_get",
            "--timeout-ms",
            "500",
        ])
        .unwrap();
        match cli.command {
            Commands::Send {
                command,
                data,
                expect,
                timeout_ms,
                json,
            } => {
                assert_eq!(command, 0x20);
                assert_eq!(data, Some(HexBytes(vec![0x02, 0x01, 0x00, 0x01, 0x00])));
                assert_eq!(expect, Some(0x20));
                assert_eq!(timeout_ms, Some(500));
                assert!(!json);
            },
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_cli_parse_send_by_byte_without_data() {
        let cli = Cli::try_parse_from(["meterlink", "send", "0x42"]).unwrap();
        match cli.command {
            Commands::Send {
                command,
                data,
                expect,
                ..
            } => {
                assert_eq!(command, 0x42);
                assert!(data.is_none());
                assert!(expect.is_none());
            },
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_cli_parse_send_invalid_command() {
        let result = Cli::try_parse_from(["meterlink", "send", "BOGUS"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_raw() {
        let cli = Cli::try_parse_from(["meterlink", "raw", "01:00:00"]).unwrap();
        match cli.command {
            Commands::Raw { bytes, listen_ms } => {
                assert_eq!(bytes, HexBytes(vec![0x01, 0x00, 0x00]));
                assert_eq!(listen_ms, 500);
            },
            _ => panic!("Expected Raw command"),
        }
    }

    #[test]
    fn test_cli_parse_raw_rejects_bad_hex() {
        let err = Cli::try_parse_from(["meterlink", "raw", "zz"])
            .err()
            .expect("bad hex should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_parse_download() {
        let cli = Cli::try_parse_from([
            "meterlink",
            "download",
            "-o",
            "results",
            "--throttle-ms",
            "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Download {
                out,
                throttle_ms,
                timeout_ms,
            } => {
                assert_eq!(out, Some(PathBuf::from("results")));
                assert_eq!(throttle_ms, Some(10));
                assert!(timeout_ms.is_none());
            },
            _ => panic!("Expected Download command"),
        }
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["meterlink", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["meterlink", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Bash),
                install: false
            }
        ));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["meterlink", "list-ports"]).unwrap();
        assert!(cli.port.is_none());
        assert!(cli.baud.is_none());
        assert!(cli.model.is_none());
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
        assert!(!cli.non_interactive);
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "meterlink",
            "identify",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "9600",
            "--model",
            "mx-400 pro",
            "-vv",
            "--non-interactive",
            "--config",
            "/tmp/meterlink.toml",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(9600));
        assert_eq!(cli.model, Some(DeviceModel::Mx400Pro));
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/meterlink.toml")));
    }

    #[test]
    fn test_cli_invalid_model() {
        let result = Cli::try_parse_from(["meterlink", "--model", "mx-9000", "identify"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        let result = Cli::try_parse_from(["meterlink"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_command_arg() {
        assert_eq!(parse_command_arg("ID_GET"), Ok(0x01));
        assert_eq!(parse_command_arg("id-get"), Ok(0x01));
        assert_eq!(parse_command_arg("0x20"), Ok(0x20));
        assert_eq!(parse_command_arg("7f"), Ok(0x7F));
        assert!(parse_command_arg("0x100").is_err());
        assert!(parse_command_arg("").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&meterlink::Error::Interrupted.into()), 130);
        assert_eq!(exit_code(&meterlink::Error::NotConnected.into()), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(meterlink::Error::Interrupted).context("Download stopped");
        assert_eq!(exit_code(&err), 130);
    }

    #[test]
    fn test_link_config_prefers_cli_model() {
        let cli = Cli::try_parse_from(["meterlink", "--model", "MX-400", "identify"]).unwrap();
        let mut config = Config::default();
        config.device.target_model = Some("MX-200S".to_string());
        config.device.handshake_timeout_ms = Some(750);

        let link_config = link_config(&cli, &config).unwrap();
        assert_eq!(link_config.target_model, DeviceModel::Mx400);
        assert_eq!(
            link_config.handshake_timeout,
            std::time::Duration::from_millis(750)
        );
    }

    #[test]
    fn test_link_config_falls_back_to_config_model() {
        let cli = Cli::try_parse_from(["meterlink", "identify"]).unwrap();
        let mut config = Config::default();
        config.device.target_model = Some("MX-200S".to_string());

        let link_config = link_config(&cli, &config).unwrap();
        assert_eq!(link_config.target_model, DeviceModel::Mx200S);
        assert_eq!(link_config.max_payload_len, LinkConfig::default().max_payload_len);
    }

    #[test]
    fn test_link_config_payload_cap_from_config() {
        let cli = Cli::try_parse_from(["meterlink", "identify"]).unwrap();
        let config: Config = toml::from_str("[device]\nmax_payload_len = 512\n").unwrap();

        let link_config = link_config(&cli, &config).unwrap();
        assert_eq!(link_config.max_payload_len, 512);
    }
}
