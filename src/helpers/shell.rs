/// Zephyr shell on top of a launched device.
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::DEFAULT_SHELL_TIMEOUT,
    device::{DeviceAdapter, Until},
    error::{HarnessError, Result},
};

pub const DEFAULT_PROMPT: &str = "uart:~$";

/// Time allowed for the device to echo a command back.
const ECHO_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval between newlines sent while waiting for the prompt.
const PROMPT_POLL: Duration = Duration::from_millis(500);

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi escape pattern")
});

/// Remove terminal escape sequences (colors, cursor movement).
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

pub struct Shell<'a> {
    device: &'a DeviceAdapter,
    prompt: String,
    timeout: Duration,
}

impl<'a> Shell<'a> {
    pub fn new(device: &'a DeviceAdapter) -> Self {
        Self {
            device,
            prompt: DEFAULT_PROMPT.to_string(),
            timeout: DEFAULT_SHELL_TIMEOUT,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    fn is_prompt(&self, line: &str) -> bool {
        strip_ansi(line).contains(&self.prompt)
    }

    /// Poke the shell with newlines until the prompt shows up.
    ///
    /// Returns `false` when `timeout` (default: the shell timeout) expires.
    pub fn wait_for_prompt(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let is_prompt = |line: &str| self.is_prompt(line);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("Prompt `{}` not seen", self.prompt);
                return Ok(false);
            }
            self.device.write(b"\n")?;
            match self.device.readlines_until(
                Until::Predicate(&is_prompt),
                Some(remaining.min(PROMPT_POLL)),
                false,
            ) {
                Ok(_) => {
                    log::debug!("Got prompt `{}`", self.prompt);
                    return Ok(true);
                }
                Err(HarnessError::Timeout { .. }) => {
                    if !self.device.connection(0)?.is_reading() {
                        log::warn!("Device output ended while waiting for the prompt");
                        return Ok(false);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `command` and return its output.
    ///
    /// The lines start with the echoed command and end with the next prompt.
    pub fn exec_command(&self, command: &str, timeout: Option<Duration>) -> Result<Vec<String>> {
        let timeout = timeout.unwrap_or(self.timeout);
        self.device.clear_buffer();
        // The second newline makes the shell print a fresh prompt even if the
        // first one was swallowed by a line being typed.
        self.device.write(format!("{command}\n\n").as_bytes())?;

        let is_echo = |line: &str| strip_ansi(line).contains(command);
        let is_prompt = |line: &str| self.is_prompt(line);
        let mut lines =
            self.device
                .readlines_until(Until::Predicate(&is_echo), Some(ECHO_TIMEOUT), true)?;
        lines.extend(
            self.device
                .readlines_until(Until::Predicate(&is_prompt), Some(timeout), true)?,
        );
        Ok(lines.iter().map(|line| strip_ansi(line)).collect())
    }

    /// Run `command` and fail unless a line matches `expected`.
    pub fn exec_command_and_assert(
        &self,
        command: &str,
        expected: &Regex,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        let lines = self.exec_command(command, timeout)?;
        if lines.iter().any(|line| expected.is_match(line)) {
            Ok(lines)
        } else {
            Err(HarnessError::Assertion {
                message: format!(
                    "`{command}` output has no line matching `{}`",
                    expected.as_str()
                ),
                transcript: lines,
            })
        }
    }

    /// Command output without prompt lines and blank lines.
    pub fn filtered_output(&self, lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .filter(|line| !line.trim().is_empty() && !self.is_prompt(line))
            .cloned()
            .collect()
    }
}
