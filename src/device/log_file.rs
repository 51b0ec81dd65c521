/// Per-test log files
///
/// A `LogFile` starts out targeting `<build>/uninitialized.log` and is
/// retargeted to `<build>/<test>.<stream>.log` before each test. Without a
/// build directory every write goes to a null sink. The file is opened
/// lazily, so a test that produces no output leaves no file behind.
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{error::Result, utils::sanitize_test_name};

pub const UNINITIALIZED_LOG: &str = "uninitialized.log";

/// Shared handle used by the reader threads and the adapter.
pub type SharedLogFile = Arc<Mutex<LogFile>>;

#[derive(Debug)]
pub struct LogFile {
    build_dir: Option<PathBuf>,
    filename: Option<PathBuf>,
    file: Option<File>,
}

impl LogFile {
    pub fn create(build_dir: Option<&Path>) -> Self {
        Self {
            build_dir: build_dir.map(Path::to_path_buf),
            filename: build_dir.map(|dir| dir.join(UNINITIALIZED_LOG)),
            file: None,
        }
    }

    pub fn shared(build_dir: Option<&Path>) -> SharedLogFile {
        Arc::new(Mutex::new(Self::create(build_dir)))
    }

    /// Target file, `None` for the null sink.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Point the log at `<build>/<test_name>.<stream>.log`.
    ///
    /// Any file open for a previous test is closed first.
    pub fn initialize(&mut self, test_name: &str, stream: &str) {
        self.close();
        if let Some(dir) = &self.build_dir {
            let name = format!("{}.{stream}.log", sanitize_test_name(test_name));
            self.filename = Some(dir.join(name));
        }
    }

    /// Append raw bytes. Empty input never touches the filesystem.
    pub fn handle(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(filename) = &self.filename else {
            return Ok(());
        };
        if self.file.is_none() {
            if let Some(parent) = filename.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(decode_backslash_replace(data).as_bytes())?;
        }
        Ok(())
    }

    /// Append text followed by a newline.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.handle(&data)
    }

    /// Flush and close. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                log::warn!("Failed to flush log file {:?}: {err}", self.filename);
            }
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode UTF-8, writing invalid bytes as `\xNN` escapes.
pub fn decode_backslash_replace(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for chunk in data.utf8_chunks() {
        out.push_str(chunk.valid());
        for byte in chunk.invalid() {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_write_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let mut log = LogFile::create(Some(&build));
        log.handle(b"").unwrap();
        assert!(!build.exists());

        log.handle(b"booting\n").unwrap();
        log.close();
        let content = std::fs::read_to_string(build.join(UNINITIALIZED_LOG)).unwrap();
        assert_eq!(content, "booting\n");
    }

    #[test]
    fn test_initialize_retargets() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::create(Some(dir.path()));
        log.initialize("test_shell[help]", "device");
        assert_eq!(
            log.filename(),
            Some(dir.path().join("test_shell_help_.device.log").as_path())
        );
        log.write_line("uart:~$").unwrap();
        log.initialize("test_other", "device");
        log.write_line("second").unwrap();
        log.close();
        log.close();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("test_shell_help_.device.log")).unwrap(),
            "uart:~$\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("test_other.device.log")).unwrap(),
            "second\n"
        );
    }

    #[test]
    fn test_null_sink() {
        let mut log = LogFile::create(None);
        log.initialize("test", "handler");
        assert!(log.filename().is_none());
        log.handle(b"dropped").unwrap();
    }

    #[test]
    fn test_backslash_replace() {
        assert_eq!(decode_backslash_replace(b"ok \xff\xfe end"), "ok \\xff\\xfe end");
        assert_eq!(decode_backslash_replace("zażółć".as_bytes()), "zażółć");
    }
}
