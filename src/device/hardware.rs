/// Physical boards reached over a serial port
///
/// Launch order: pre-script, then flash and open the console (in the order
/// selected by `flash_before`), then the post-flash script. Closing runs the
/// post-script. A `serial_pty` command replaces the serial port with a
/// pseudo-terminal whose other end the command serves.
use std::{
    fs::File,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    pty::openpty,
    sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg},
};

use crate::{
    config::DeviceConfig,
    device::{DeviceBackend, DeviceLogs, DeviceStream},
    error::{HarnessError, Result},
    utils::{log_command, run_with_timeout, terminate_process, TERMINATE_GRACE},
};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
const SERIAL_OPEN_RETRY: Duration = Duration::from_millis(250);

pub fn construct(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>> {
    Ok(Box::new(HardwareBackend::new(config.clone())))
}

pub struct HardwareBackend {
    config: DeviceConfig,
    /// Program standing in for `west` in the flash command.
    west: PathBuf,
    serial_pty: Option<Child>,
}

impl HardwareBackend {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            west: PathBuf::from("west"),
            serial_pty: None,
        }
    }

    pub fn with_west(mut self, west: impl Into<PathBuf>) -> Self {
        self.west = west.into();
        self
    }

    fn flash(&self, logs: &DeviceLogs) -> Result<()> {
        let command = flash_command(&self.config)?;
        let rendered = log_command("Flashing device", &command);
        logs.handler_line(&format!("Flashing: {rendered}"));

        let output = run_with_timeout(
            Command::new(&self.west).args(&command[1..]),
            self.config.flash_timeout,
        )
        .map_err(|err| HarnessError::Launch {
            message: format!("cannot run `{}`: {err}", self.west.display()),
            output: String::new(),
        })?;
        logs.flash_output(&output.stdout);
        logs.flash_output(&output.stderr);

        if output.timed_out {
            return Err(HarnessError::Launch {
                message: format!("flashing timed out after {:?}", self.config.flash_timeout),
                output: output.stderr_text(),
            });
        }
        if !output.success() {
            let status = output
                .status
                .map_or_else(|| "unknown status".to_string(), |s| s.to_string());
            return Err(HarnessError::Launch {
                message: format!("flashing failed: {status}"),
                output: output.stderr_text(),
            });
        }
        log::info!("Flashing finished");
        logs.handler_line("Flashing finished");
        Ok(())
    }

    fn open_streams(&mut self, logs: &DeviceLogs) -> Result<Vec<DeviceStream>> {
        if let Some(command) = self.config.serial_pty.clone() {
            return Ok(vec![self.open_serial_pty(&command, logs)?]);
        }
        self.config
            .serial
            .iter()
            .enumerate()
            .map(|(index, port)| {
                open_serial(
                    port,
                    self.config.baud,
                    self.config.connection_timeout,
                    index,
                )
            })
            .collect()
    }

    fn open_serial_pty(&mut self, command: &str, logs: &DeviceLogs) -> Result<DeviceStream> {
        let args: Vec<&str> = command
            .split([',', ' '])
            .filter(|part| !part.is_empty())
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return Err(HarnessError::config("empty --device-serial-pty command"));
        };

        let pty = openpty(None, None)?;
        let mut termios = tcgetattr(&pty.slave)?;
        cfmakeraw(&mut termios);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

        let rendered = log_command("Starting serial PTY", &args);
        logs.handler_line(&format!("Serial PTY: {rendered}"));
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::from(pty.master.try_clone()?))
            .stdout(Stdio::from(pty.master.try_clone()?))
            .stderr(Stdio::from(pty.master))
            .spawn()
            .map_err(|err| HarnessError::Launch {
                message: format!("cannot start serial PTY command `{command}`: {err}"),
                output: String::new(),
            })?;
        self.serial_pty = Some(child);

        let slave = File::from(pty.slave);
        let writer = slave.try_clone()?;
        Ok(DeviceStream::new("serial-pty", slave, writer))
    }

    fn stop_serial_pty(&mut self, logs: &DeviceLogs) {
        if let Some(mut child) = self.serial_pty.take() {
            let status = terminate_process(&mut child, TERMINATE_GRACE);
            logs.handler_line(&format!("Serial PTY command finished: {status:?}"));
        }
    }
}

impl DeviceBackend for HardwareBackend {
    fn start(&mut self, logs: &DeviceLogs) -> Result<Vec<DeviceStream>> {
        if let Some(script) = &self.config.pre_script {
            run_custom_script(script, logs);
        }
        if self.config.flash_before {
            self.flash(logs)?;
            if let Some(script) = &self.config.post_flash_script {
                run_custom_script(script, logs);
            }
        }
        self.open_streams(logs)
    }

    fn after_connect(&mut self, logs: &DeviceLogs) -> Result<()> {
        if self.config.flash_before {
            return Ok(());
        }
        self.flash(logs)?;
        if let Some(script) = &self.config.post_flash_script {
            run_custom_script(script, logs);
        }
        Ok(())
    }

    fn stop(&mut self, logs: &DeviceLogs) {
        self.stop_serial_pty(logs);
        if let Some(script) = &self.config.post_script {
            run_custom_script(script, logs);
        }
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        if let Some(mut child) = self.serial_pty.take() {
            terminate_process(&mut child, TERMINATE_GRACE);
        }
    }
}

/// Open a serial console, retrying until `timeout` while the port is absent
/// (boards re-enumerate after a reset).
fn open_serial(port: &str, baud: u32, timeout: Duration, index: usize) -> Result<DeviceStream> {
    let deadline = Instant::now() + timeout;
    let serial = loop {
        match serialport::new(port, baud)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()
        {
            Ok(serial) => break serial,
            Err(err) if Instant::now() < deadline => {
                log::debug!("Opening {port} failed ({err}), retrying");
                std::thread::sleep(SERIAL_OPEN_RETRY);
            }
            Err(err) => {
                return Err(HarnessError::Launch {
                    message: format!("cannot open serial port {port} @ {baud}: {err}"),
                    output: String::new(),
                })
            }
        }
    };
    log::info!("Opened serial port {port} @ {baud}");
    let writer = serial.try_clone()?;
    let name = if index == 0 {
        port.to_string()
    } else {
        format!("{port}#{index}")
    };
    Ok(DeviceStream::new(name, serial, writer))
}

/// Run a pre/post script with a fixed timeout. Failures are logged only.
fn run_custom_script(script: &Path, logs: &DeviceLogs) {
    let rendered = log_command("Running script", &[script.to_string_lossy()]);
    logs.handler_line(&format!("Running script: {rendered}"));
    match run_with_timeout(&mut Command::new(script), SCRIPT_TIMEOUT) {
        Ok(output) if output.timed_out => {
            log::error!("Script {} timed out", script.display());
            logs.handler_line(&format!("Script {} timed out", script.display()));
        }
        Ok(output) => {
            logs.handler_line(&String::from_utf8_lossy(&output.stdout));
            if !output.success() {
                log::error!("Script {} failed: {:?}", script.display(), output.status);
                logs.handler_line(&format!(
                    "Script {} failed: {}",
                    script.display(),
                    output.stderr_text()
                ));
            }
        }
        Err(err) => {
            log::error!("Cannot run script {}: {err}", script.display());
            logs.handler_line(&format!("Cannot run script {}: {err}", script.display()));
        }
    }
}

/// `west flash` command line for the configured board.
pub fn flash_command(config: &DeviceConfig) -> Result<Vec<String>> {
    let build_dir: PathBuf = config
        .build_dir
        .clone()
        .ok_or_else(|| HarnessError::config("--build-dir is required to flash"))?;

    let mut command: Vec<String> = ["west", "flash", "--skip-rebuild", "-d"]
        .into_iter()
        .map(String::from)
        .collect();
    command.push(build_dir.to_string_lossy().into_owned());

    let mut extra: Vec<String> = Vec::new();
    if let Some(runner) = &config.runner {
        command.push("--runner".to_string());
        command.push(runner.clone());
        if let Some(id) = &config.id {
            extra.extend(runner_id_args(runner, config.product.as_deref(), id));
        }
    }
    extra.extend(config.runner_params.iter().cloned());
    extra.extend(config.west_flash_extra_args.iter().cloned());
    if !extra.is_empty() {
        command.push("--".to_string());
        command.extend(extra);
    }
    Ok(command)
}

/// Arguments selecting one probe among several for a given runner.
fn runner_id_args(runner: &str, product: Option<&str>, id: &str) -> Vec<String> {
    match runner {
        "pyocd" => vec!["--board-id".into(), id.into()],
        "nrfjprog" | "nrfutil" | "jlink" => vec!["--dev-id".into(), id.into()],
        "openocd" => {
            let command = match product {
                Some("STM32 STLink") | Some("STLINK-V3") => format!("hla_serial {id}"),
                Some("EDBG CMSIS-DAP") => format!("cmsis_dap_serial {id}"),
                _ => format!("adapter serial {id}"),
            };
            vec!["--cmd-pre-init".into(), command]
        }
        "stm32cubeprogrammer" => vec![format!("--tool-opt=sn={id}")],
        "linkserver" => vec!["--probe".into(), id.into()],
        other => {
            log::warn!("Runner {other} has no known way to select a probe by id");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DeviceType,
        device::{DeviceAdapter, DeviceState},
    };
    use std::os::unix::fs::PermissionsExt;

    fn config(runner: &str) -> DeviceConfig {
        let mut config = DeviceConfig::new(DeviceType::Hardware).with_build_dir("/build");
        config.runner = Some(runner.to_string());
        config.id = Some("0001".to_string());
        config.serial = vec!["/dev/ttyACM0".to_string()];
        config
    }

    #[test]
    fn test_flash_command_pyocd() {
        let mut config = config("pyocd");
        config.west_flash_extra_args = vec!["--erase".to_string()];
        assert_eq!(
            flash_command(&config).unwrap(),
            vec![
                "west", "flash", "--skip-rebuild", "-d", "/build", "--runner", "pyocd", "--",
                "--board-id", "0001", "--erase"
            ]
        );
    }

    #[test]
    fn test_runner_id_args() {
        assert_eq!(
            runner_id_args("openocd", None, "42"),
            vec!["--cmd-pre-init", "adapter serial 42"]
        );
        assert_eq!(
            runner_id_args("openocd", Some("STLINK-V3"), "42"),
            vec!["--cmd-pre-init", "hla_serial 42"]
        );
        assert_eq!(runner_id_args("nrfutil", None, "42"), vec!["--dev-id", "42"]);
        assert_eq!(
            runner_id_args("stm32cubeprogrammer", None, "42"),
            vec!["--tool-opt=sn=42"]
        );
        assert!(runner_id_args("esp32", None, "42").is_empty());
    }

    #[test]
    fn test_flash_without_runner() {
        let mut config = config("pyocd");
        config.runner = None;
        assert_eq!(
            flash_command(&config).unwrap(),
            vec!["west", "flash", "--skip-rebuild", "-d", "/build"]
        );
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Board on a serial PTY whose scripts and flasher append to `order`.
    fn board(dir: &Path, flash_before: bool, flasher: &str) -> DeviceAdapter {
        board_with(dir, flash_before, flasher, |_| {})
    }

    fn board_with(
        dir: &Path,
        flash_before: bool,
        flasher: &str,
        tweak: impl FnOnce(&mut DeviceConfig),
    ) -> DeviceAdapter {
        let order = dir.join("order");
        let record = |name: &str| format!("echo {name} >> {}", order.display());

        let mut config = DeviceConfig::new(DeviceType::Hardware).with_build_dir(dir);
        config.flash_before = flash_before;
        config.pre_script = Some(write_script(dir, "pre.sh", &record("pre")));
        config.post_flash_script = Some(write_script(dir, "post_flash.sh", &record("post_flash")));
        config.post_script = Some(write_script(dir, "post.sh", &record("post")));
        let pty = write_script(dir, "pty.sh", "exec sleep 30");
        config.serial_pty = Some(pty.to_string_lossy().into_owned());
        let west = write_script(dir, "west", &format!("{}\n{flasher}", record("flash")));
        tweak(&mut config);

        let backend = HardwareBackend::new(config.clone()).with_west(west);
        let mut device = DeviceAdapter::with_backend(config, Box::new(backend));
        device.initialize_log_files("test_board");
        device
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_launch_order() {
        for flash_before in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let mut device = board(dir.path(), flash_before, "exit 0");
            device.launch().unwrap();
            assert_eq!(read(dir.path().join("order")), "pre\nflash\npost_flash\n");
            device.close();
            assert_eq!(
                read(dir.path().join("order")),
                "pre\nflash\npost_flash\npost\n"
            );

            let handler = read(dir.path().join("test_board.handler.log"));
            let pty = handler.find("Serial PTY: ").unwrap();
            let flash = handler.find("Flashing: ").unwrap();
            assert_eq!(flash < pty, flash_before, "{handler}");
        }
    }

    #[test]
    fn test_flash_failure_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = board(dir.path(), true, "echo 'probe 0001 not found' >&2\nexit 3");
        match device.launch() {
            Err(HarnessError::Launch { output, .. }) => {
                assert!(output.contains("probe 0001 not found"), "{output}")
            }
            other => panic!("unexpected launch result: {other:?}"),
        }
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(!read(dir.path().join("order")).contains("post_flash"));
        assert!(read(dir.path().join("test_board.flash.log")).contains("probe 0001 not found"));
    }

    #[test]
    fn test_flash_timeout_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = board_with(dir.path(), false, "exec sleep 30", |config| {
            config.flash_timeout = Duration::from_millis(500)
        });
        let started = Instant::now();
        match device.launch() {
            Err(HarnessError::Launch { message, .. }) => {
                assert!(message.contains("timed out"), "{message}")
            }
            other => panic!("unexpected launch result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_unlaunched_board_runs_no_post_script() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("post-script-ran");
        let mut config = DeviceConfig::new(DeviceType::Hardware).with_build_dir(dir.path());
        config.serial_pty = Some("cat".to_string());
        config.post_script = Some(write_script(
            dir.path(),
            "post.sh",
            &format!("touch {}", marker.display()),
        ));
        drop(DeviceAdapter::new(config).unwrap());
        assert!(!marker.exists());
    }
}
