/// Babblesim driver
///
/// Copies a built `native_sim` executable into the Babblesim binary
/// directory and runs the shell scripts that wire several simulated devices
/// together.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    time::Duration,
};

use crate::{
    error::{HarnessError, Result},
    utils::{log_command, run_with_timeout},
};

pub const BSIM_OUT_PATH: &str = "BSIM_OUT_PATH";

#[derive(Debug, Default)]
pub struct BsimDriver {
    last_status: Option<ExitStatus>,
    output: Vec<String>,
}

impl BsimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `<build>/zephyr/zephyr.exe` to `$BSIM_OUT_PATH/bin/<new_name>`.
    ///
    /// Returns the destination path. An existing file is overwritten.
    pub fn copy_app(
        &self,
        env: &HashMap<String, String>,
        build_dir: &Path,
        new_name: &str,
    ) -> Result<PathBuf> {
        let out_path = env
            .get(BSIM_OUT_PATH)
            .ok_or_else(|| HarnessError::config(format!("{BSIM_OUT_PATH} is not set")))?;

        let source = [
            build_dir.join("zephyr").join("zephyr.exe"),
            build_dir.join("zephyr.exe"),
        ]
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| {
            HarnessError::config(format!(
                "no zephyr.exe in build directory {}",
                build_dir.display()
            ))
        })?;

        let bin_dir = Path::new(out_path).join("bin");
        std::fs::create_dir_all(&bin_dir)?;
        let destination = bin_dir.join(new_name);
        std::fs::copy(&source, &destination)?;
        log::info!("Copied {} to {}", source.display(), destination.display());
        Ok(destination)
    }

    /// Run a Babblesim test script, killing its process group on timeout.
    ///
    /// The return code and the output are kept on the driver; a non-zero code
    /// is returned as a value, not an error.
    pub fn run_script(&mut self, script: &Path, timeout: Duration) -> Result<i32> {
        let script_str = script.to_string_lossy();
        log_command("Running Babblesim script", &[script_str.as_ref()]);

        let mut command = Command::new(script);
        if let Some(dir) = script.parent().filter(|dir| dir.is_dir()) {
            command.current_dir(dir);
        }
        let output = run_with_timeout(&mut command, timeout)?;

        self.output = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();
        for line in &self.output {
            log::debug!("#: {line}");
        }

        if output.timed_out {
            self.last_status = None;
            return Err(HarnessError::timeout(
                format!("{} did not finish within {timeout:?}", script.display()),
                self.output.clone(),
            ));
        }
        self.last_status = output.status;
        let code = output.status.and_then(|s| s.code()).unwrap_or(-1);
        if code != 0 {
            log::error!("{} exited with code {code}", script.display());
        }
        Ok(code)
    }

    /// Return code of the last script run, `None` if it was killed.
    pub fn last_returncode(&self) -> Option<i32> {
        self.last_status.and_then(|s| s.code())
    }

    /// Captured stdout followed by stderr of the last script run.
    pub fn output(&self) -> &[String] {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("test.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_copy_app() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(build.join("zephyr")).unwrap();
        std::fs::write(build.join("zephyr/zephyr.exe"), b"ELF").unwrap();

        let out = dir.path().join("bsim_out");
        let env = HashMap::from([(BSIM_OUT_PATH.to_string(), out.to_string_lossy().into_owned())]);
        let driver = BsimDriver::new();
        let destination = driver.copy_app(&env, &build, "bs_nrf52_central").unwrap();
        assert_eq!(destination, out.join("bin/bs_nrf52_central"));
        assert_eq!(std::fs::read(&destination).unwrap(), b"ELF");

        // Overwrites.
        std::fs::write(build.join("zephyr/zephyr.exe"), b"ELF2").unwrap();
        driver.copy_app(&env, &build, "bs_nrf52_central").unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"ELF2");

        assert!(driver.copy_app(&HashMap::new(), &build, "x").is_err());
    }

    #[test]
    fn test_run_script_records_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = BsimDriver::new();

        let ok = script(dir.path(), "echo PROJECT EXECUTION SUCCESSFUL");
        assert_eq!(driver.run_script(&ok, Duration::from_secs(10)).unwrap(), 0);
        assert_eq!(driver.last_returncode(), Some(0));
        assert_eq!(driver.output(), ["PROJECT EXECUTION SUCCESSFUL"]);

        let failing = script(dir.path(), "echo failed >&2; exit 2");
        assert_eq!(driver.run_script(&failing, Duration::from_secs(10)).unwrap(), 2);
        assert_eq!(driver.last_returncode(), Some(2));
    }

    #[test]
    fn test_run_script_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = BsimDriver::new();
        let slow = script(dir.path(), "echo started; sleep 30");
        let err = driver
            .run_script(&slow, Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
        assert_eq!(driver.last_returncode(), None);
    }
}
