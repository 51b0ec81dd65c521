/// QEMU driven through the build system's `run` target
///
/// The emulator console is bridged to a FIFO pair in the build directory:
/// QEMU reads `qemu-fifo.in` and writes `qemu-fifo.out`.
use std::{
    fs::{File, OpenOptions},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};

use nix::{
    sys::{
        signal::{kill, Signal},
        stat::Mode,
    },
    unistd::{mkfifo, Pid},
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::DeviceConfig,
    device::{DeviceBackend, DeviceLogs, DeviceStream},
    error::{HarnessError, Result},
    utils::{find_in_file, log_command, terminate_process, TERMINATE_GRACE},
};

pub const QEMU_FIFO_NAME: &str = "qemu-fifo";
const QEMU_PID_FILE: &str = "qemu.pid";

static CMAKE_GENERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CMAKE_GENERATOR:INTERNAL=(.*)$").expect("generator pattern"));

pub fn construct(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>> {
    let build_dir = config
        .build_dir
        .clone()
        .ok_or_else(|| HarnessError::config("--build-dir is required for qemu"))?;
    Ok(Box::new(QemuBackend::new(
        build_dir,
        config.connection_timeout,
    )))
}

pub struct QemuBackend {
    build_dir: PathBuf,
    connection_timeout: Duration,
    child: Option<Child>,
}

/// `ninja` or `make`, from the CMake cache of the build.
pub fn detect_generator(build_dir: &Path) -> &'static str {
    match find_in_file(build_dir.join("CMakeCache.txt"), &CMAKE_GENERATOR) {
        Some(generator) if generator.contains("Makefiles") => "make",
        _ => "ninja",
    }
}

impl QemuBackend {
    pub fn new(build_dir: PathBuf, connection_timeout: Duration) -> Self {
        Self {
            build_dir,
            connection_timeout,
            child: None,
        }
    }

    fn fifo_base(&self) -> PathBuf {
        self.build_dir.join(QEMU_FIFO_NAME)
    }

    fn fifo_paths(&self) -> (PathBuf, PathBuf) {
        let base = self.fifo_base().to_string_lossy().into_owned();
        (
            PathBuf::from(format!("{base}.in")),
            PathBuf::from(format!("{base}.out")),
        )
    }

    fn make_fifos(&self) -> Result<()> {
        let (fifo_in, fifo_out) = self.fifo_paths();
        for path in [&fifo_in, &fifo_out] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)?;
        }
        Ok(())
    }

    fn remove_fifos(&self) {
        let (fifo_in, fifo_out) = self.fifo_paths();
        for path in [fifo_in, fifo_out] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Cannot remove {}: {err}", path.display());
                }
            }
        }
    }

    /// Open the read side of the output FIFO; blocks until QEMU opens its end.
    fn open_output(&self, fifo_out: &Path) -> Result<File> {
        let (tx, rx) = flume::bounded(1);
        let path = fifo_out.to_path_buf();
        std::thread::spawn(move || {
            let _ = tx.send(File::open(&path));
        });
        match rx.recv_timeout(self.connection_timeout) {
            Ok(file) => Ok(file?),
            Err(_) => {
                // Unblock the opener thread by playing the writer ourselves.
                if let Ok(writer) = OpenOptions::new().write(true).open(fifo_out) {
                    drop(writer);
                }
                Err(HarnessError::timeout(
                    format!(
                        "QEMU did not open {} within {:?}",
                        fifo_out.display(),
                        self.connection_timeout
                    ),
                    Vec::new(),
                ))
            }
        }
    }

    fn kill_qemu(&self, logs: &DeviceLogs) {
        let pid_file = self.build_dir.join(QEMU_PID_FILE);
        let Ok(text) = std::fs::read_to_string(&pid_file) else {
            return;
        };
        if let Ok(pid) = text.trim().parse::<i32>() {
            log::debug!("Sending SIGTERM to QEMU process {pid}");
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                logs.handler_line(&format!("Cannot terminate QEMU process {pid}: {err}"));
            }
        }
    }
}

impl DeviceBackend for QemuBackend {
    fn start(&mut self, logs: &DeviceLogs) -> Result<Vec<DeviceStream>> {
        self.make_fifos()?;
        let (fifo_in, fifo_out) = self.fifo_paths();

        let generator = detect_generator(&self.build_dir);
        let build = self.build_dir.to_string_lossy().into_owned();
        let args = [generator, "-C", build.as_str(), "run"];
        let rendered = log_command("Running QEMU", &args);
        logs.handler_line(&format!("Running: {rendered}"));

        let child = Command::new(generator)
            .args(&args[1..])
            .env("QEMU_PIPE", self.fifo_base())
            .current_dir(&self.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|err| HarnessError::Launch {
                message: format!("cannot start `{generator}`: {err}"),
                output: String::new(),
            })?;
        log::info!("Started QEMU via {generator} with PID {}", child.id());
        self.child = Some(child);

        // Read+write never blocks on a FIFO without a reader.
        let input = OpenOptions::new().read(true).write(true).open(&fifo_in)?;
        let output = self.open_output(&fifo_out)?;
        Ok(vec![DeviceStream::new("qemu", output, input)])
    }

    fn stop(&mut self, logs: &DeviceLogs) {
        self.kill_qemu(logs);
        if let Some(mut child) = self.child.take() {
            let status = terminate_process(&mut child, TERMINATE_GRACE);
            logs.handler_line(&format!("QEMU run target finished: {status:?}"));
        }
        self.remove_fifos();
    }
}

impl Drop for QemuBackend {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_process(&mut child, TERMINATE_GRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_generator() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_generator(dir.path()), "ninja");

        std::fs::write(
            dir.path().join("CMakeCache.txt"),
            "CMAKE_GENERATOR:INTERNAL=Unix Makefiles\n",
        )
        .unwrap();
        assert_eq!(detect_generator(dir.path()), "make");
    }

    #[test]
    fn test_fifos_created_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = QemuBackend::new(dir.path().to_path_buf(), Duration::from_millis(100));
        let (fifo_in, fifo_out) = backend.fifo_paths();
        assert!(fifo_in.ends_with("qemu-fifo.in"));

        // A stale regular file is replaced.
        std::fs::write(&fifo_out, "stale").unwrap();
        backend.make_fifos().unwrap();
        assert!(fifo_in.exists() && fifo_out.exists());
        assert!(!fifo_out.is_file());

        // Nobody opens the writer side: opening the output times out.
        let err = backend.open_output(&fifo_out).unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));

        backend.remove_fifos();
        assert!(!fifo_in.exists() && !fifo_out.exists());
    }
}
