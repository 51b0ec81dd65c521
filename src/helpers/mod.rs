//! Helpers layered over a launched device: the Zephyr shell and the parser
//! for MCUboot status output.

pub mod mcuboot;
pub mod shell;

pub use mcuboot::{parse_mcuboot_output, McubootArea, McubootStatus};
pub use shell::{strip_ansi, Shell, DEFAULT_PROMPT};
