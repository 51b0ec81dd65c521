//! Device adapters
//!
//! A [`DeviceAdapter`] owns the configuration of one device under test, the
//! per-test log files and the open connections. What it means to start and
//! stop a device lives behind the [`DeviceBackend`] trait: a simulator
//! process, a board on a serial port, or a QEMU instance.
//!
//! ```text
//! NEW --launch--> RUNNING --close--> CLOSED --launch--> RUNNING ...
//!        \--launch fails--> CLOSED
//!        \--close--> CLOSED (backend untouched)
//! ```

pub mod binary;
pub mod connection;
pub mod factory;
pub mod hardware;
pub mod log_file;
pub mod qemu;

use std::{path::PathBuf, time::Duration};

pub use connection::{Connection, DeviceStream, Until, LINE_QUEUE_CAPACITY};
pub use log_file::{LogFile, SharedLogFile};

use crate::{
    config::DeviceConfig,
    error::{HarnessError, Result},
};

/// How long `close` waits for readers before stopping the backend.
const READER_STOP_GRACE: Duration = Duration::from_millis(200);
/// How long `close` waits for readers after the backend stopped.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    New,
    Running,
    Closed,
}

/// Variant specific part of a device.
pub trait DeviceBackend: Send {
    /// Bring the device up and return one stream per connection.
    /// The first stream is the main console.
    fn start(&mut self, logs: &DeviceLogs) -> Result<Vec<DeviceStream>>;

    /// Runs once the reader threads are attached to the streams.
    fn after_connect(&mut self, _logs: &DeviceLogs) -> Result<()> {
        Ok(())
    }

    /// Tear the device down. Failures are logged, never returned.
    fn stop(&mut self, logs: &DeviceLogs);
}

/// Log files owned by one adapter.
pub struct DeviceLogs {
    build_dir: Option<PathBuf>,
    test_name: Option<String>,
    pub handler: SharedLogFile,
    pub flash: SharedLogFile,
    device: Vec<SharedLogFile>,
}

fn device_stream_name(index: usize) -> String {
    if index == 0 {
        "device".to_string()
    } else {
        format!("device.{index}")
    }
}

impl DeviceLogs {
    fn new(build_dir: Option<PathBuf>) -> Self {
        let dir = build_dir.as_deref();
        Self {
            handler: LogFile::shared(dir),
            flash: LogFile::shared(dir),
            device: vec![LogFile::shared(dir)],
            build_dir,
            test_name: None,
        }
    }

    /// Log file for connection `index`, created on first use.
    pub fn device(&mut self, index: usize) -> SharedLogFile {
        while self.device.len() <= index {
            let log = LogFile::shared(self.build_dir.as_deref());
            if let Some(test_name) = &self.test_name {
                log.lock()
                    .initialize(test_name, &device_stream_name(self.device.len()));
            }
            self.device.push(log);
        }
        self.device[index].clone()
    }

    /// Append one line to the handler log.
    pub fn handler_line(&self, line: &str) {
        if let Err(err) = self.handler.lock().write_line(line) {
            log::warn!("Failed to write handler log: {err}");
        }
    }

    /// Append raw flasher output to the flash log.
    pub fn flash_output(&self, data: &[u8]) {
        if let Err(err) = self.flash.lock().handle(data) {
            log::warn!("Failed to write flash log: {err}");
        }
    }

    fn initialize(&mut self, test_name: &str) {
        self.handler.lock().initialize(test_name, "handler");
        self.flash.lock().initialize(test_name, "flash");
        for (index, log) in self.device.iter().enumerate() {
            log.lock().initialize(test_name, &device_stream_name(index));
        }
        self.test_name = Some(test_name.to_string());
    }

    fn close(&self) {
        self.handler.lock().close();
        self.flash.lock().close();
        for log in &self.device {
            log.lock().close();
        }
    }
}

pub struct DeviceAdapter {
    config: DeviceConfig,
    backend: Box<dyn DeviceBackend>,
    logs: DeviceLogs,
    connections: Vec<Connection>,
    state: DeviceState,
}

impl DeviceAdapter {
    /// Build the adapter registered for the configured device type.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let constructor = factory::get_device(config.device_type.as_ref())?;
        let backend = constructor(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: DeviceConfig, backend: Box<dyn DeviceBackend>) -> Self {
        let logs = DeviceLogs::new(config.build_dir.clone());
        Self {
            config,
            backend,
            logs,
            connections: Vec::new(),
            state: DeviceState::New,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn logs(&self) -> &DeviceLogs {
        &self.logs
    }

    /// Retarget every log file to `test_name` for the upcoming test.
    pub fn initialize_log_files(&mut self, test_name: &str) {
        self.logs.initialize(test_name);
    }

    pub fn launch(&mut self) -> Result<()> {
        if self.state == DeviceState::Running {
            return Err(HarnessError::State(
                "device is already launched; close it first".to_string(),
            ));
        }
        log::info!("Launching {} device", self.config.device_type);
        self.logs
            .handler_line(&format!("Launching {} device", self.config.device_type));

        match self.start_connections() {
            Ok(()) => {
                self.state = DeviceState::Running;
                Ok(())
            }
            Err(err) => {
                log::error!("Launch of {} device failed: {err}", self.config.device_type);
                self.logs.handler_line(&format!("Launch failed: {err}"));
                self.shutdown();
                Err(err)
            }
        }
    }

    fn start_connections(&mut self) -> Result<()> {
        let streams = self.backend.start(&self.logs)?;
        if streams.is_empty() {
            return Err(HarnessError::Launch {
                message: "backend opened no connection to the device".to_string(),
                output: String::new(),
            });
        }
        for (index, stream) in streams.into_iter().enumerate() {
            let device_log = self.logs.device(index);
            let connection = Connection::start(stream, device_log, self.logs.handler.clone())?;
            self.connections.push(connection);
        }
        self.backend.after_connect(&self.logs)
    }

    /// Stop readers and processes and close log files. Safe from any state.
    pub fn close(&mut self) {
        match self.state {
            DeviceState::Closed => {}
            // Never started: nothing to tear down and no post-script to run.
            DeviceState::New => self.state = DeviceState::Closed,
            DeviceState::Running => {
                log::info!("Closing {} device", self.config.device_type);
                self.shutdown();
            }
        }
    }

    fn shutdown(&mut self) {
        for connection in &self.connections {
            connection.signal_stop();
        }
        for connection in &self.connections {
            connection.wait_reader(READER_STOP_GRACE);
        }
        self.backend.stop(&self.logs);
        for connection in self.connections.drain(..) {
            connection.join(READER_JOIN_TIMEOUT);
        }
        self.logs.close();
        self.state = DeviceState::Closed;
    }

    fn running(&self) -> Result<&Connection> {
        if self.state != DeviceState::Running {
            return Err(HarnessError::State(format!(
                "device is not running (state {:?})",
                self.state
            )));
        }
        self.connection(0)
    }

    /// Connection `index`; 0 is the main console.
    pub fn connection(&self, index: usize) -> Result<&Connection> {
        self.connections.get(index).ok_or_else(|| {
            HarnessError::State(format!(
                "no connection {index} ({} open)",
                self.connections.len()
            ))
        })
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.running()?.write(data)
    }

    /// Next line from the main console, waiting up to `timeout`
    /// (default: the base timeout).
    pub fn readline(&self, timeout: Option<Duration>) -> Result<String> {
        self.running()?
            .readline(timeout.unwrap_or(self.config.base_timeout))
    }

    pub fn readlines_until(
        &self,
        until: Until<'_>,
        timeout: Option<Duration>,
        print_output: bool,
    ) -> Result<Vec<String>> {
        self.running()?.readlines_until(
            until,
            timeout.unwrap_or(self.config.base_timeout),
            print_output,
        )
    }

    /// Blocking iterator over main console lines.
    pub fn iter_stdout(&self) -> Result<flume::Iter<'_, String>> {
        Ok(self.running()?.iter_lines())
    }

    pub fn clear_buffer(&self) {
        for connection in &self.connections {
            connection.clear_buffer();
        }
    }
}

impl Drop for DeviceAdapter {
    fn drop(&mut self) {
        self.close();
    }
}
