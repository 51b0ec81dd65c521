//! Twister harness: drives firmware under test from Rust
//!
//! A device is described by a [`config::DeviceConfig`] and brought up by a
//! [`device::DeviceAdapter`]: a native simulator or unit test executable, a
//! custom binary, a board on a serial port, or QEMU. The adapter streams the
//! device console into per-test log files and a line queue that the helpers
//! in [`helpers`] read from. The SMP device management client lives in the
//! `twister_smp` package and is re-exported as [`smp`].
//!
//! Test code usually goes through [`fixtures`]: parse the command line into
//! a configuration, open a [`fixtures::Session`] and take one
//! [`fixtures::Dut`] per test.

#[doc(hidden)]
pub mod boot;
pub mod bsim;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod fixtures;
pub mod helpers;
pub mod utils;

pub use twister_smp as smp;

pub use config::{DeviceConfig, DeviceType, TwisterHarnessConfig};
pub use device::{DeviceAdapter, DeviceState, Until};
pub use error::{HarnessError, Result};
pub use fixtures::{parse_config, Dut, Session};
pub use helpers::Shell;
