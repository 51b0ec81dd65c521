/// SMP header encoding
///
/// Every SMP packet starts with an 8 byte header:
///
/// ```text
/// | res:3 ver:2 op:3 | flags | len (BE u16) | group (BE u16) | seq | id |
/// ```
///
/// `len` counts the CBOR payload that follows, not the header itself.
use crate::error::{Result, SmpError};

pub const SMP_HEADER_LEN: usize = 8;

/// Protocol version written into outgoing requests (SMP version 2).
pub const SMP_VERSION: u8 = 1;

/// SMP operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    ReadRsp,
    Write,
    WriteRsp,
}

impl Op {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Op::Read),
            1 => Ok(Op::ReadRsp),
            2 => Ok(Op::Write),
            3 => Ok(Op::WriteRsp),
            other => Err(SmpError::Frame(format!("unknown op {other}"))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Op::Read => 0,
            Op::ReadRsp => 1,
            Op::Write => 2,
            Op::WriteRsp => 3,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Op::ReadRsp | Op::WriteRsp)
    }
}

/// Management groups used by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Os,
    Image,
    Other(u16),
}

impl Group {
    pub fn id(self) -> u16 {
        match self {
            Group::Os => 0,
            Group::Image => 1,
            Group::Other(id) => id,
        }
    }

    pub fn from_id(id: u16) -> Self {
        match id {
            0 => Group::Os,
            1 => Group::Image,
            other => Group::Other(other),
        }
    }
}

/// Command ids inside the OS group.
pub mod os {
    pub const ECHO: u8 = 0;
    pub const RESET: u8 = 5;
}

/// Command ids inside the image group.
pub mod image {
    pub const STATE: u8 = 0;
    pub const UPLOAD: u8 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    pub op: Op,
    pub version: u8,
    pub flags: u8,
    pub len: u16,
    pub group: Group,
    pub seq: u8,
    pub id: u8,
}

impl SmpHeader {
    pub fn request(op: Op, group: Group, id: u8, seq: u8, len: u16) -> Self {
        Self {
            op,
            version: SMP_VERSION,
            flags: 0,
            len,
            group,
            seq,
            id,
        }
    }

    pub fn encode(&self) -> [u8; SMP_HEADER_LEN] {
        let group = self.group.id().to_be_bytes();
        let len = self.len.to_be_bytes();
        [
            ((self.version & 0x03) << 3) | self.op.bits(),
            self.flags,
            len[0],
            len[1],
            group[0],
            group[1],
            self.seq,
            self.id,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SMP_HEADER_LEN {
            return Err(SmpError::Frame(format!(
                "header needs {SMP_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            op: Op::from_bits(bytes[0] & 0x07)?,
            version: (bytes[0] >> 3) & 0x03,
            flags: bytes[1],
            len: u16::from_be_bytes([bytes[2], bytes[3]]),
            group: Group::from_id(u16::from_be_bytes([bytes[4], bytes[5]])),
            seq: bytes[6],
            id: bytes[7],
        })
    }

    /// Total packet length (header plus payload).
    pub fn packet_len(&self) -> usize {
        SMP_HEADER_LEN + self.len as usize
    }
}
