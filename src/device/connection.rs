/// One open channel to the device and its reader thread
///
/// The reader pulls small chunks from the device stream, splits them into
/// lines and fans every line out to the device log (raw bytes) and to a
/// bounded queue (decoded text) the test thread consumes.
use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use regex::Regex;

use crate::{
    device::log_file::SharedLogFile,
    error::{HarnessError, Result},
};

pub const LINE_QUEUE_CAPACITY: usize = 10_000;
const READ_CHUNK: usize = 1024;

pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Raw streams handed over by a backend when it starts.
pub struct DeviceStream {
    pub name: String,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl DeviceStream {
    pub fn new(
        name: impl Into<String>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Stop condition for [`Connection::readlines_until`].
pub enum Until<'a> {
    /// Stop at the first line matching the regex.
    Regex(&'a Regex),
    /// Stop at the first line the predicate accepts.
    Predicate(&'a dyn Fn(&str) -> bool),
    /// Stop after this many lines.
    Lines(usize),
}

impl Until<'_> {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Until::Regex(regex) => regex.is_match(line),
            Until::Predicate(predicate) => predicate(line),
            Until::Lines(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Until::Regex(regex) => format!("a line matching `{}`", regex.as_str()),
            Until::Predicate(_) => "a line accepted by the predicate".to_string(),
            Until::Lines(count) => format!("{count} lines"),
        }
    }
}

pub struct Connection {
    name: String,
    writer: SharedWriter,
    lines: Receiver<String>,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    reader: Option<JoinHandle<()>>,
}

struct ReaderContext {
    name: String,
    tx: Sender<String>,
    overflow: Receiver<String>,
    device_log: SharedLogFile,
    handler_log: SharedLogFile,
    stop: Arc<AtomicBool>,
    warned_overflow: bool,
}

impl Connection {
    pub fn start(
        stream: DeviceStream,
        device_log: SharedLogFile,
        handler_log: SharedLogFile,
    ) -> Result<Self> {
        Self::start_with_capacity(stream, device_log, handler_log, LINE_QUEUE_CAPACITY)
    }

    pub fn start_with_capacity(
        stream: DeviceStream,
        device_log: SharedLogFile,
        handler_log: SharedLogFile,
        capacity: usize,
    ) -> Result<Self> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let mut context = ReaderContext {
            name: stream.name.clone(),
            tx,
            overflow: rx.clone(),
            device_log,
            handler_log,
            stop: stop.clone(),
            warned_overflow: false,
        };
        let mut reader = stream.reader;
        let handle = std::thread::Builder::new()
            .name(format!("reader-{}", stream.name))
            .spawn(move || {
                context.run(&mut reader);
                drop(done_tx);
            })?;

        log::debug!("Started reader thread for {}", stream.name);
        Ok(Self {
            name: stream.name,
            writer: Arc::new(Mutex::new(stream.writer)),
            lines: rx,
            stop,
            done: done_rx,
            reader: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn readline(&self, timeout: Duration) -> Result<String> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(HarnessError::timeout(
                format!("no line from {} within {timeout:?}", self.name),
                Vec::new(),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(HarnessError::timeout(
                format!("output of {} ended", self.name),
                Vec::new(),
            )),
        }
    }

    /// Collect lines up to and including the first one satisfying `until`.
    pub fn readlines_until(
        &self,
        until: Until<'_>,
        timeout: Duration,
        print_output: bool,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            if let Until::Lines(count) = until {
                if lines.len() >= count {
                    return Ok(lines);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    if print_output {
                        log::info!("#: {line}");
                    }
                    let hit = until.is_match(&line);
                    lines.push(line);
                    if hit {
                        return Ok(lines);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(HarnessError::timeout(
                        format!(
                            "did not find {} on {} within {timeout:?}",
                            until.describe(),
                            self.name
                        ),
                        lines,
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(HarnessError::timeout(
                        format!(
                            "output of {} ended before {} was found",
                            self.name,
                            until.describe()
                        ),
                        lines,
                    ))
                }
            }
        }
    }

    /// Blocking iterator over lines; ends when the device output ends.
    pub fn iter_lines(&self) -> flume::Iter<'_, String> {
        self.lines.iter()
    }

    /// Drop queued lines. Returns how many were dropped.
    pub fn clear_buffer(&self) -> usize {
        self.lines.drain().count()
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.done.try_recv(), Err(flume::TryRecvError::Empty))
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for the reader to exit. Returns true once it has.
    pub(crate) fn wait_reader(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Join the reader, detaching it if it does not exit within `timeout`.
    pub(crate) fn join(mut self, timeout: Duration) {
        self.signal_stop();
        if self.wait_reader(timeout) {
            if let Some(handle) = self.reader.take() {
                if handle.join().is_err() {
                    log::warn!("Reader thread for {} panicked", self.name);
                }
            }
        } else {
            log::warn!(
                "Reader thread for {} still running after {timeout:?}, detaching",
                self.name
            );
        }
    }
}

impl ReaderContext {
    fn run(&mut self, reader: &mut Box<dyn Read + Send>) {
        let mut buf = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        self.deliver(&line);
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    if !self.stop.load(Ordering::Acquire) {
                        self.handler_line(&format!("Reading from {} failed: {err}", self.name));
                    }
                    break;
                }
            }
        }
        if !pending.is_empty() {
            self.deliver(&pending);
        }
        log::debug!("Reader thread for {} finished", self.name);
    }

    fn deliver(&mut self, raw: &[u8]) {
        if let Err(err) = self.device_log.lock().handle(raw) {
            log::warn!("Failed to write device log for {}: {err}", self.name);
        }

        let text = raw.strip_suffix(b"\n").unwrap_or(raw);
        let text = text.strip_suffix(b"\r").unwrap_or(text);
        let mut line = String::from_utf8_lossy(text).into_owned();
        loop {
            match self.tx.try_send(line) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.overflow.try_recv();
                    if !self.warned_overflow {
                        self.warned_overflow = true;
                        self.handler_line(&format!(
                            "Line queue of {} is full, dropping oldest lines",
                            self.name
                        ));
                    }
                    line = rejected;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }

    fn handler_line(&self, message: &str) {
        log::warn!("{message}");
        if let Err(err) = self.handler_log.lock().write_line(message) {
            log::warn!("Failed to write handler log: {err}");
        }
    }
}
