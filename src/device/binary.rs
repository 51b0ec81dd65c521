/// Simulator executables: native builds, unit test binaries and custom scripts.
///
/// The three variants only differ in the command line. The process runs in its
/// own process group with stdout and stderr merged into one pipe.
use std::{
    fs::File,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
};

use crate::{
    config::DeviceConfig,
    device::{DeviceBackend, DeviceLogs, DeviceStream},
    error::{HarnessError, Result},
    utils::{log_command, terminate_process, TERMINATE_GRACE},
};

pub struct BinaryBackend {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    child: Option<Child>,
}

impl BinaryBackend {
    pub fn new(program: PathBuf, args: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self {
            program,
            args,
            cwd,
            child: None,
        }
    }

    /// Full command line, program first.
    pub fn command(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn spawn(&self) -> Result<(Child, File)> {
        // Other threads may spawn processes meanwhile; they must not inherit
        // the write end or the reader never sees EOF.
        #[cfg(target_os = "linux")]
        let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        #[cfg(not(target_os = "linux"))]
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        let stderr_fd = write_fd.try_clone()?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(write_fd))
            .stderr(Stdio::from(stderr_fd))
            .process_group(0);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        let child = command.spawn().map_err(|err| HarnessError::Launch {
            message: format!("cannot start {}: {err}", self.program.display()),
            output: String::new(),
        })?;
        // Drops our copies of the write end so the reader sees EOF when the
        // process exits.
        drop(command);
        Ok((child, File::from(read_fd)))
    }
}

impl DeviceBackend for BinaryBackend {
    fn start(&mut self, logs: &DeviceLogs) -> Result<Vec<DeviceStream>> {
        if !self.program.is_file() {
            return Err(HarnessError::Launch {
                message: format!("there is no binary file {}", self.program.display()),
                output: String::new(),
            });
        }
        let rendered = log_command("Running simulator", &self.command());
        logs.handler_line(&format!("Running: {rendered}"));

        let (mut child, output) = self.spawn()?;
        log::info!("Started {} with PID {}", self.program.display(), child.id());
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                terminate_process(&mut child, TERMINATE_GRACE);
                return Err(HarnessError::Launch {
                    message: "child process has no stdin".to_string(),
                    output: String::new(),
                });
            }
        };
        self.child = Some(child);
        Ok(vec![DeviceStream::new("device", output, stdin)])
    }

    fn stop(&mut self, logs: &DeviceLogs) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        match terminate_process(&mut child, TERMINATE_GRACE) {
            Some(status) => {
                log::info!("Process {pid} finished: {status}");
                logs.handler_line(&format!("Process {pid} finished: {status}"));
            }
            None => logs.handler_line(&format!("Process {pid} exit status unknown")),
        }
    }
}

impl Drop for BinaryBackend {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_process(&mut child, TERMINATE_GRACE);
        }
    }
}

fn build_dir(config: &DeviceConfig) -> Result<PathBuf> {
    config
        .build_dir
        .clone()
        .ok_or_else(|| HarnessError::config("--build-dir is required"))
}

/// `<build>/zephyr/zephyr.exe`, or `--binary-file` when given.
pub fn native(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>> {
    let build = build_dir(config)?;
    let program = config
        .binary_file
        .clone()
        .unwrap_or_else(|| build.join("zephyr").join("zephyr.exe"));
    Ok(Box::new(BinaryBackend::new(
        program,
        config.extra_args.clone(),
        Some(build),
    )))
}

/// `<build>/testbinary` produced by a unit test build.
pub fn unit(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>> {
    let build = build_dir(config)?;
    Ok(Box::new(BinaryBackend::new(
        build.join("testbinary"),
        config.extra_args.clone(),
        Some(build),
    )))
}

/// Any script or program given with `--binary-file`.
pub fn custom(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>> {
    let program = config
        .binary_file
        .clone()
        .ok_or_else(|| HarnessError::config("--binary-file is required for custom devices"))?;
    Ok(Box::new(BinaryBackend::new(
        program,
        config.extra_args.clone(),
        config.build_dir.clone().filter(|dir| dir.is_dir()),
    )))
}
