/// SMP over UDP: one datagram carries exactly one packet.
use std::{
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use crate::{
    error::{Result, SmpError},
    transport::Transport,
};

/// Port the mcumgr UDP transport listens on by default.
pub const DEFAULT_PORT: u16 = 1337;

const MAX_DATAGRAM: usize = 2048;

pub struct UdpTransport {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// `address` is `host` or `host:port`; the port defaults to 1337.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            socket: None,
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let with_port = if self.address.parse::<SocketAddr>().is_ok()
            || self.address.rsplit_once(':').is_some_and(|(host, port)| {
                !host.contains(':') && port.parse::<u16>().is_ok()
            }) {
            self.address.clone()
        } else if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{DEFAULT_PORT}", self.address)
        } else {
            format!("{}:{DEFAULT_PORT}", self.address)
        };
        with_port
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SmpError::Frame(format!("cannot resolve {}", self.address)))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Transport for UdpTransport {
    fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let remote = self.resolve()?;
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(remote)?;
        log::info!("Opened SMP UDP transport to {remote}");
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Closed SMP UDP transport to {}", self.address);
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(SmpError::NotOpen)?;
        socket.send(frame)?;
        Ok(())
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let socket = self.socket.as_ref().ok_or(SmpError::NotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SmpError::Timeout {
                    seq: 0,
                    timeout_ms: timeout.as_millis(),
                });
            }
            socket.set_read_timeout(Some(remaining))?;
            match socket.recv(&mut buf) {
                Ok(n) => return Ok(buf[..n].to_vec()),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}
