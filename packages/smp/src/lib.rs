//! Simple Management Protocol (SMP) client used by the harness to talk to the
//! mcumgr subsystem of a device under test.
//!
//! The crate is split along the same seam as the protocol itself:
//! - [`header`]: the 8 byte SMP header and the group/command identifiers
//! - [`client`]: request/response matching and the typed operations
//! - [`transport`]: framing over a serial console, UDP datagrams and
//!   Bluetooth L2CAP
//!
//! Payloads are CBOR maps kept as a [`ciborium::Value`] tree.

pub mod client;
pub mod error;
pub mod header;
pub mod image;
pub mod transport;

pub use ciborium::Value;

pub use client::{SmpClient, SmpResponse, DEFAULT_TIMEOUT};
pub use error::{Result, SmpError};
pub use header::{Group, Op, SmpHeader, SMP_HEADER_LEN};
pub use image::{ImageState, ImageStates};
pub use transport::{
    l2cap::L2capTransport, serial::SerialTransport, udp::UdpTransport, Transport,
};
