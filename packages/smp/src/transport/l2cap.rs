/// SMP over a Bluetooth LE L2CAP connection oriented channel.
///
/// Uses a raw `AF_BLUETOOTH` seqpacket socket, so it is only available on
/// Linux. A packet larger than the channel MTU arrives in several SDUs; they
/// are joined using the length from the SMP header.
use std::time::Duration;

use crate::{
    error::{Result, SmpError},
    header::{SmpHeader, SMP_HEADER_LEN},
    transport::Transport,
};

/// Parse `AA:BB:CC:DD:EE:FF` into the little endian byte order used by the
/// kernel socket address.
pub fn parse_bdaddr(address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        return Err(SmpError::Frame(format!("invalid Bluetooth address {address:?}")));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[5 - i] = u8::from_str_radix(part, 16)
            .map_err(|_| SmpError::Frame(format!("invalid Bluetooth address {address:?}")))?;
    }
    Ok(out)
}

/// Joins SDUs until a full SMP packet is available.
#[derive(Debug, Default)]
struct Reassembly {
    buf: Vec<u8>,
}

impl Reassembly {
    fn push(&mut self, sdu: &[u8]) -> Result<Option<Vec<u8>>> {
        self.buf.extend_from_slice(sdu);
        if self.buf.len() < SMP_HEADER_LEN {
            return Ok(None);
        }
        let total = match SmpHeader::decode(&self.buf) {
            Ok(header) => header.packet_len(),
            Err(err) => {
                self.buf.clear();
                return Err(err);
            }
        };
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }
}

pub struct L2capTransport {
    address: String,
    psm: u16,
    reassembly: Reassembly,
    #[cfg(target_os = "linux")]
    socket: Option<std::os::fd::OwnedFd>,
}

impl L2capTransport {
    pub fn new(address: &str, psm: u16) -> Self {
        Self {
            address: address.to_string(),
            psm,
            reassembly: Reassembly::default(),
            #[cfg(target_os = "linux")]
            socket: None,
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::{
        io,
        os::fd::{AsRawFd, FromRawFd, OwnedFd},
        time::Duration,
    };

    pub const AF_BLUETOOTH: libc::c_int = 31;
    pub const BTPROTO_L2CAP: libc::c_int = 0;
    pub const BDADDR_LE_PUBLIC: u8 = 1;

    #[repr(C)]
    pub struct SockaddrL2 {
        pub l2_family: libc::sa_family_t,
        pub l2_psm: u16,
        pub l2_bdaddr: [u8; 6],
        pub l2_cid: u16,
        pub l2_bdaddr_type: u8,
    }

    pub fn connect(bdaddr: [u8; 6], psm: u16) -> io::Result<OwnedFd> {
        // SAFETY: plain socket(2) call; the descriptor is owned right away.
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor nobody else owns.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = SockaddrL2 {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: psm.to_le(),
            l2_bdaddr: bdaddr,
            l2_cid: 0,
            l2_bdaddr_type: BDADDR_LE_PUBLIC,
        };
        // SAFETY: `addr` is a valid sockaddr_l2 for the given length.
        let rc = unsafe {
            libc::connect(
                socket.as_raw_fd(),
                &addr as *const SockaddrL2 as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }

    pub fn send(socket: &OwnedFd, data: &[u8]) -> io::Result<()> {
        // SAFETY: the buffer is valid for `data.len()` bytes.
        let rc = unsafe {
            libc::send(
                socket.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout` for one SDU. `Ok(None)` means the wait timed out.
    pub fn recv(socket: &OwnedFd, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Ok(None);
        }
        // SAFETY: the buffer is valid for `buf.len()` bytes.
        let n = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "L2CAP channel closed"));
        }
        Ok(Some(n as usize))
    }
}

#[cfg(target_os = "linux")]
impl Transport for L2capTransport {
    fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let bdaddr = parse_bdaddr(&self.address)?;
        let socket = sys::connect(bdaddr, self.psm)?;
        log::info!("Connected L2CAP channel to {} psm {:#x}", self.address, self.psm);
        self.socket = Some(socket);
        self.reassembly = Reassembly::default();
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Closed L2CAP channel to {}", self.address);
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(SmpError::NotOpen)?;
        sys::send(socket, frame)?;
        Ok(())
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            let socket = self.socket.as_ref().ok_or(SmpError::NotOpen)?;
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let Some(n) = sys::recv(socket, &mut buf, remaining)? else {
                return Err(SmpError::Timeout {
                    seq: 0,
                    timeout_ms: timeout.as_millis(),
                });
            };
            if let Some(packet) = self.reassembly.push(&buf[..n])? {
                return Ok(packet);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for L2capTransport {
    fn open(&mut self) -> Result<()> {
        Err(SmpError::Unsupported("l2cap"))
    }

    fn close(&mut self) {}

    fn send_frame(&mut self, _frame: &[u8]) -> Result<()> {
        Err(SmpError::Unsupported("l2cap"))
    }

    fn receive_frame(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        Err(SmpError::Unsupported("l2cap"))
    }
}
