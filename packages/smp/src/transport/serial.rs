/// SMP over a serial console
///
/// Packets are wrapped the way the mcumgr console transport expects:
/// `len (BE u16) | packet | crc16 (BE)`, base64 encoded and cut into lines of
/// at most 127 bytes. The first line starts with `0x06 0x09`, continuation
/// lines with `0x04 0x14`, every line ends with `\n`. `len` covers the packet
/// and the CRC. The CRC is CRC-16/XMODEM over the packet.
use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{
    error::{Result, SmpError},
    transport::Transport,
};

const FRAME_START: [u8; 2] = [0x06, 0x09];
const FRAME_CONTINUE: [u8; 2] = [0x04, 0x14];
const MAX_LINE: usize = 127;
/// Base64 bytes per line: line limit minus marker and newline, kept a multiple of 4.
const LINE_PAYLOAD: usize = (MAX_LINE - 3) / 4 * 4;
const READ_POLL: Duration = Duration::from_millis(50);

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Encode one SMP packet into console lines.
pub fn encode_frame(packet: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(packet.len() + 4);
    raw.extend_from_slice(&((packet.len() + 2) as u16).to_be_bytes());
    raw.extend_from_slice(packet);
    raw.extend_from_slice(&CRC16.checksum(packet).to_be_bytes());

    let encoded = STANDARD.encode(&raw);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_PAYLOAD * 3 + 3);
    for (i, chunk) in encoded.as_bytes().chunks(LINE_PAYLOAD).enumerate() {
        out.extend_from_slice(if i == 0 { &FRAME_START } else { &FRAME_CONTINUE });
        out.extend_from_slice(chunk);
        out.push(b'\n');
    }
    out
}

/// Incremental decoder for console framed packets.
///
/// Bytes that are not part of an SMP frame (regular console output) are
/// skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    line: Vec<u8>,
    body: Vec<u8>,
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every packet completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        for &byte in bytes {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            if let Some(packet) = self.push_line(&line)? {
                packets.push(packet);
            }
        }
        Ok(packets)
    }

    fn push_line(&mut self, line: &[u8]) -> Result<Option<Vec<u8>>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() < 2 {
            return Ok(None);
        }
        let (marker, payload) = line.split_at(2);
        if marker == FRAME_START {
            self.body.clear();
            self.expected = None;
        } else if marker != FRAME_CONTINUE || self.expected.is_none() {
            return Ok(None);
        }

        let decoded = STANDARD
            .decode(payload)
            .map_err(|err| SmpError::Frame(format!("invalid base64: {err}")))?;
        self.body.extend_from_slice(&decoded);

        if self.expected.is_none() {
            if self.body.len() < 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
            self.body.drain(..2);
            self.expected = Some(len);
        }

        match self.expected {
            Some(len) if self.body.len() >= len => {
                self.expected = None;
                let mut body = std::mem::take(&mut self.body);
                body.truncate(len);
                if len < 2 {
                    return Err(SmpError::Frame(format!("frame length {len} too short")));
                }
                let crc = body.split_off(len - 2);
                let expected = u16::from_be_bytes([crc[0], crc[1]]);
                let actual = CRC16.checksum(&body);
                if expected != actual {
                    return Err(SmpError::Crc { expected, actual });
                }
                Ok(Some(body))
            }
            _ => Ok(None),
        }
    }
}

pub struct SerialTransport {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
    decoder: FrameDecoder,
    /// Packets decoded but not handed out yet; one read may complete several.
    pending: VecDeque<Vec<u8>>,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud,
            port: None,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Wrap a port that is already open.
    pub fn from_port(port: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            port_name: port.name().unwrap_or_default(),
            baud: port.baud_rate().unwrap_or_default(),
            port: Some(port),
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        log::info!("Opening SMP serial transport {} @ {}", self.port_name, self.baud);
        let port = serialport::new(&self.port_name, self.baud)
            .timeout(READ_POLL)
            .open()?;
        self.port = Some(port);
        self.decoder = FrameDecoder::new();
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("Closed SMP serial transport {}", self.port_name);
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(SmpError::NotOpen)?;
        port.write_all(&encode_frame(frame))?;
        port.flush()?;
        Ok(())
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(packet);
        }
        let port = self.port.as_mut().ok_or(SmpError::NotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.pending.extend(self.decoder.push(&buf[..n])?);
                    if let Some(packet) = self.pending.pop_front() {
                        return Ok(packet);
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(err) => return Err(err.into()),
            }
            if Instant::now() >= deadline {
                return Err(SmpError::Timeout {
                    seq: 0,
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_packet_single_line() {
        let packet = [0x0a, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00, 0xa0, 0xff];
        let encoded = encode_frame(&packet);
        assert_eq!(&encoded[..2], &FRAME_START);
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&encoded).unwrap(), vec![packet.to_vec()]);
    }

    #[test]
    fn test_long_packet_spans_lines() {
        let packet: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let encoded = encode_frame(&packet);
        for line in encoded.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            assert!(line.len() + 1 <= MAX_LINE);
        }
        assert!(encoded.windows(2).any(|w| w == FRAME_CONTINUE));

        // Interleave console noise and split the input at odd boundaries.
        let mut input = b"uart:~$ \r\n[00:00:01] <inf> app: hello\n".to_vec();
        input.extend_from_slice(&encoded);
        let mut decoder = FrameDecoder::new();
        let mut packets = Vec::new();
        for chunk in input.chunks(7) {
            packets.extend(decoder.push(chunk).unwrap());
        }
        assert_eq!(packets, vec![packet]);
    }

    #[test]
    fn test_frames_from_one_read_are_all_delivered() {
        use crate::header::{Group, Op, SmpHeader};

        let (mut master, slave) = serialport::TTYPort::pair().unwrap();
        let mut transport = SerialTransport::from_port(Box::new(slave));

        let first = SmpHeader::request(Op::WriteRsp, Group::Os, 0, 1, 0).encode();
        let second = SmpHeader::request(Op::WriteRsp, Group::Os, 0, 2, 0).encode();
        let mut bytes = encode_frame(&first);
        bytes.extend_from_slice(&encode_frame(&second));
        master.write_all(&bytes).unwrap();
        master.flush().unwrap();

        let timeout = Duration::from_secs(1);
        let packet = transport.receive_frame(timeout).unwrap();
        assert_eq!(SmpHeader::decode(&packet).unwrap().seq, 1);
        let packet = transport.receive_frame(timeout).unwrap();
        assert_eq!(SmpHeader::decode(&packet).unwrap().seq, 2);
    }

    #[test]
    fn test_crc_mismatch() {
        let mut raw = vec![0x00, 0x04, 0x01, 0x02, 0x00, 0x00];
        raw[4] = 0xde;
        let mut line = FRAME_START.to_vec();
        line.extend_from_slice(STANDARD.encode(&raw).as_bytes());
        line.push(b'\n');

        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.push(&line), Err(SmpError::Crc { .. })));
    }
}
