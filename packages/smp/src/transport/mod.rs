//! Frame transports for the SMP client.
//!
//! A transport moves complete SMP packets (header plus payload). Each one owns
//! its own file descriptor; none of them share the console connection used by
//! the device adapter.

pub mod l2cap;
pub mod serial;
pub mod udp;

use std::time::Duration;

use crate::error::Result;

pub trait Transport: Send {
    /// Open the underlying channel. Calling `open` on an open transport is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Release the underlying channel. Never fails.
    fn close(&mut self);

    /// Send one complete SMP packet.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for one complete SMP packet.
    fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        (**self).send_frame(frame)
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive_frame(timeout)
    }
}
