//! Command line surface of the harness
//!
//! The same options are used by the `twister-harness` binary and by test
//! code that calls [`crate::fixtures::parse_config`] with its own argument
//! list.

use std::{path::PathBuf, time::Duration};

use clap::{parser::ValueSource, Arg, ArgAction, ArgMatches, Command};
use strum::IntoEnumIterator;

use crate::{
    config::{
        DeviceConfig, DeviceType, HardwareMap, McumgrConfig, McumgrTransport,
        TwisterHarnessConfig,
    },
    error::{HarnessError, Result},
    utils::normalize_path,
};

/// Add every harness option to `command`.
pub fn harness_args(command: Command) -> Command {
    let device_types: Vec<&'static str> = DeviceType::iter().map(Into::into).collect();
    let mcumgr_transports: Vec<&'static str> = McumgrTransport::iter().map(Into::into).collect();

    command
        .arg(
            Arg::new("twister-harness")
                .long("twister-harness")
                .help("Enable the twister harness")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("build-dir")
                .long("build-dir")
                .help("Directory with the built application (required unless --device-type=custom)")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("device-type")
                .long("device-type")
                .help("Kind of device under test")
                .value_name("TYPE")
                .value_parser(device_types),
        )
        .arg(
            Arg::new("platform")
                .long("platform")
                .help("Name of the board the application was built for")
                .value_name("PLATFORM"),
        )
        .arg(
            Arg::new("device-serial")
                .long("device-serial")
                .help("Serial port of the device; repeat to open additional consoles")
                .value_name("PORT")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("device-serial-baud")
                .long("device-serial-baud")
                .help("Serial port baud rate")
                .value_name("BAUD")
                .default_value("115200")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("device-serial-pty")
                .long("device-serial-pty")
                .help("Command serving the console on a pseudo-terminal instead of a serial port")
                .value_name("COMMAND")
                .conflicts_with("device-serial"),
        )
        .arg(
            Arg::new("device-id")
                .long("device-id")
                .help("Probe or board id passed to the flash runner")
                .value_name("ID"),
        )
        .arg(
            Arg::new("device-product")
                .long("device-product")
                .help("Probe product name, used to pick runner arguments")
                .value_name("PRODUCT"),
        )
        .arg(
            Arg::new("hardware-map")
                .long("hardware-map")
                .help("Twister hardware map (YAML) describing connected boards")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("runner")
                .long("runner")
                .help("West flash runner")
                .value_name("RUNNER"),
        )
        .arg(
            Arg::new("runner-params")
                .long("runner-params")
                .help("Extra runner parameter, may be repeated")
                .value_name("PARAM")
                .allow_hyphen_values(true)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("west-flash-extra-args")
                .long("west-flash-extra-args")
                .help("Comma separated arguments appended to `west flash`")
                .value_name("ARGS")
                .allow_hyphen_values(true)
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("pre-script")
                .long("pre-script")
                .help("Script run before flashing")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("post-script")
                .long("post-script")
                .help("Script run after the test")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("post-flash-script")
                .long("post-flash-script")
                .help("Script run right after flashing")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("flash-before")
                .long("flash-before")
                .help("Flash before opening the serial port (boot output is lost)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("flash-timeout")
                .long("flash-timeout")
                .help("Seconds allowed for flashing")
                .value_name("SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("base-timeout")
                .long("base-timeout")
                .help("Default seconds to wait for device output")
                .value_name("SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("shell-timeout")
                .long("shell-timeout")
                .help("Default seconds to wait for a shell command")
                .value_name("SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("connection-timeout")
                .long("connection-timeout")
                .help("Seconds to wait for the device console to appear")
                .value_name("SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("binary-file")
                .long("binary-file")
                .help("Executable to run (custom devices, or instead of zephyr.exe)")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("fixture")
                .long("fixture")
                .help("Fixture available on the device, may be repeated")
                .value_name("NAME")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("extra-args")
                .long("extra-args")
                .help("Extra argument passed to the simulator, may be repeated")
                .value_name("ARG")
                .allow_hyphen_values(true)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("mcumgr-transport")
                .long("mcumgr-transport")
                .help("Transport of the device management client")
                .value_name("TRANSPORT")
                .default_value("serial")
                .value_parser(mcumgr_transports),
        )
        .arg(
            Arg::new("mcumgr-serial")
                .long("mcumgr-serial")
                .help("Serial port for SMP (defaults to the device console)")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("mcumgr-udp-addr")
                .long("mcumgr-udp-addr")
                .help("Address of the SMP UDP server, port 1337 unless given")
                .value_name("ADDR"),
        )
        .arg(
            Arg::new("mcumgr-l2cap-addr")
                .long("mcumgr-l2cap-addr")
                .help("Bluetooth address of the SMP L2CAP server")
                .value_name("BDADDR"),
        )
        .arg(
            Arg::new("mcumgr-l2cap-psm")
                .long("mcumgr-l2cap-psm")
                .help("L2CAP PSM of the SMP server")
                .value_name("PSM")
                .default_value("128")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("mcumgr-timeout")
                .long("mcumgr-timeout")
                .help("Seconds to wait for an SMP response")
                .value_name("SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(f64)),
        )
}

/// Harness options on their own.
pub fn build_command() -> Command {
    harness_args(Command::new("twister-harness").no_binary_name(true))
}

fn seconds(matches: &ArgMatches, id: &str) -> Result<Duration> {
    let value = matches.get_one::<f64>(id).copied().unwrap_or_default();
    Duration::try_from_secs_f64(value)
        .map_err(|_| HarnessError::config(format!("--{id} must be a non-negative number")))
}

fn path(matches: &ArgMatches, id: &str) -> Option<PathBuf> {
    matches.get_one::<String>(id).map(normalize_path)
}

fn string(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.get_one::<String>(id).cloned()
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn from_command_line(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

/// Turn parsed options into a configuration.
///
/// Returns `None` when `--twister-harness` is absent.
pub fn config_from_matches(matches: &ArgMatches) -> Result<Option<TwisterHarnessConfig>> {
    if !matches.get_flag("twister-harness") {
        return Ok(None);
    }

    let device_type: DeviceType = matches
        .get_one::<String>("device-type")
        .ok_or_else(|| HarnessError::config("--device-type is required"))?
        .parse()
        .map_err(|_| HarnessError::config("unknown --device-type"))?;

    let mut device = DeviceConfig::new(device_type);
    device.build_dir = path(matches, "build-dir");
    device.binary_file = path(matches, "binary-file");
    device.serial = strings(matches, "device-serial");
    device.serial_pty = string(matches, "device-serial-pty");
    device.baud = matches
        .get_one::<u32>("device-serial-baud")
        .copied()
        .unwrap_or(crate::config::DEFAULT_BAUD);
    device.id = string(matches, "device-id");
    device.product = string(matches, "device-product");
    device.platform = string(matches, "platform");
    device.runner = string(matches, "runner");
    device.runner_params = strings(matches, "runner-params");
    device.west_flash_extra_args = strings(matches, "west-flash-extra-args");
    device.pre_script = path(matches, "pre-script");
    device.post_script = path(matches, "post-script");
    device.post_flash_script = path(matches, "post-flash-script");
    device.fixtures = strings(matches, "fixture");
    device.extra_args = strings(matches, "extra-args");
    device.flash_before = matches.get_flag("flash-before");
    device.flash_timeout = seconds(matches, "flash-timeout")?;
    device.base_timeout = seconds(matches, "base-timeout")?;
    device.connection_timeout = seconds(matches, "connection-timeout")?;

    if let Some(map_path) = path(matches, "hardware-map") {
        let map = HardwareMap::load(&map_path)?;
        let board = map.select(device.id.as_deref(), device.platform.as_deref())?;
        apply_board(&mut device, board, matches)?;
    }

    device.validate()?;

    let mcumgr = McumgrConfig {
        transport: matches
            .get_one::<String>("mcumgr-transport")
            .map(|t| t.parse())
            .transpose()
            .map_err(|_| HarnessError::config("unknown --mcumgr-transport"))?
            .unwrap_or(McumgrTransport::Serial),
        serial: string(matches, "mcumgr-serial").or_else(|| device.serial.first().cloned()),
        udp_addr: string(matches, "mcumgr-udp-addr")
            .unwrap_or_else(|| McumgrConfig::default().udp_addr),
        l2cap_addr: string(matches, "mcumgr-l2cap-addr"),
        l2cap_psm: matches
            .get_one::<u16>("mcumgr-l2cap-psm")
            .copied()
            .unwrap_or(McumgrConfig::default().l2cap_psm),
        timeout: seconds(matches, "mcumgr-timeout")?,
    };

    log::debug!("Device configuration: {device:?}");
    Ok(Some(TwisterHarnessConfig {
        devices: vec![device],
        shell_timeout: seconds(matches, "shell-timeout")?,
        mcumgr,
    }))
}

/// Fill values missing on the command line from a hardware map entry.
fn apply_board(
    device: &mut DeviceConfig,
    board: &crate::config::HardwareMapEntry,
    matches: &ArgMatches,
) -> Result<()> {
    log::info!(
        "Using board {} ({}) from hardware map",
        board.platform,
        board.id.as_deref().unwrap_or("no id")
    );
    device.platform.get_or_insert_with(|| board.platform.clone());
    if device.id.is_none() {
        device.id = board.id.clone();
    }
    if device.product.is_none() {
        device.product = board.product.clone();
    }
    if device.serial.is_empty() && device.serial_pty.is_none() {
        device.serial.extend(board.serial.clone());
        device.serial_pty = board.serial_pty.clone();
    }
    if !from_command_line(matches, "device-serial-baud") {
        if let Some(baud) = board.baud {
            device.baud = baud;
        }
    }
    if device.runner.is_none() {
        device.runner = board.runner.clone();
    }
    if device.runner_params.is_empty() {
        device.runner_params = board.runner_params.clone();
    }
    for (slot, value) in [
        (&mut device.pre_script, &board.pre_script),
        (&mut device.post_script, &board.post_script),
        (&mut device.post_flash_script, &board.post_flash_script),
    ] {
        if slot.is_none() {
            *slot = value.clone();
        }
    }
    if device.fixtures.is_empty() {
        device.fixtures = board.fixtures.clone();
    }
    if !device.flash_before {
        device.flash_before = board.flash_before.unwrap_or(false);
    }

    if let Some(map_timeout) = board.flash_timeout {
        let map_timeout = Duration::from_secs(map_timeout);
        if from_command_line(matches, "flash-timeout") {
            if device.flash_timeout != map_timeout {
                return Err(HarnessError::config(format!(
                    "--flash-timeout {:?} conflicts with flash_timeout {:?} in the hardware map",
                    device.flash_timeout, map_timeout
                )));
            }
        } else {
            device.flash_timeout = map_timeout;
        }
    }
    Ok(())
}
