use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target};

/// Environment variable naming a file that receives a copy of the log.
pub const LOG_FILE_ENV: &str = "TWISTER_HARNESS_LOG_FILE";

/// Multi-writer for logging to both file and stdout
struct DualWriter {
    file: std::fs::File,
    stdout: io::Stdout,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()?;
        Ok(())
    }
}

/// Set up logging for the binary.
///
/// Logs go to stdout, and also to `$TWISTER_HARNESS_LOG_FILE` when it is set.
pub fn init_logger() {
    match std::env::var(LOG_FILE_ENV).ok() {
        Some(path) => {
            if let Err(err) = init_dual_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                builder(Target::Stdout).init();
            }
        }
        None => builder(Target::Stdout).init(),
    }
}

fn builder(target: Target) -> Builder {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(target)
        .filter_level(LevelFilter::Info)
        .parse_default_env();
    builder
}

fn init_dual_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let dual_writer = DualWriter {
        file,
        stdout: io::stdout(),
    };
    builder(Target::Pipe(Box::new(dual_writer))).init();

    log::info!("Logging to terminal and {path}");
    Ok(())
}
