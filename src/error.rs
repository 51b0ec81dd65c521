use thiserror::Error;

/// Errors surfaced by the harness to test code.
///
/// Transport and subprocess failures are translated into one of these kinds
/// before they leave the crate.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A required option is missing, a device type is unknown, or a value is
    /// out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// The device failed to start. `output` carries whatever the failing tool
    /// printed (for example the flasher's stderr).
    #[error("launch failed: {message}")]
    Launch { message: String, output: String },

    /// A bounded wait expired. `lines` holds the output captured so far.
    #[error("timeout: {message}")]
    Timeout { message: String, lines: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Expected output was not observed.
    #[error("assertion failed: {message}")]
    Assertion {
        message: String,
        transcript: Vec<String>,
    },

    /// Lifecycle misuse, e.g. a second launch or a write before launch.
    #[error("invalid device state: {0}")]
    State(String),

    #[error("device management error: {0}")]
    Smp(#[from] twister_smp::SmpError),
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn timeout(message: impl Into<String>, lines: Vec<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            lines,
        }
    }

    /// Partial output attached to a timeout, empty for other kinds.
    pub fn partial_lines(&self) -> &[String] {
        match self {
            Self::Timeout { lines, .. } => lines,
            Self::Assertion { transcript, .. } => transcript,
            _ => &[],
        }
    }
}

impl From<serialport::Error> for HarnessError {
    fn from(err: serialport::Error) -> Self {
        Self::Io(err.into())
    }
}

impl From<nix::Error> for HarnessError {
    fn from(err: nix::Error) -> Self {
        Self::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
