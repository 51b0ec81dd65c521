/// SMP request/response client
///
/// The client is transport agnostic: it serializes a request into a header and
/// a CBOR payload, hands the packet to a [`Transport`] and waits for the
/// response carrying the same sequence number. Responses for other sequence
/// numbers are logged and dropped; responses arriving late for a request that
/// already timed out are discarded silently.
use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use ciborium::Value;

use crate::{
    error::{Result, SmpError},
    header::{self, Group, Op, SmpHeader, SMP_HEADER_LEN},
    image::{as_i64, cbor_map, map_get, ImageStates},
    transport::Transport,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single SMP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum SmpResponse<T> {
    Success(T),
    Error { code: i64, reason: String },
}

impl<T> SmpResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, SmpResponse::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            SmpResponse::Success(payload) => Some(payload),
            SmpResponse::Error { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SmpResponse<U> {
        match self {
            SmpResponse::Success(payload) => SmpResponse::Success(f(payload)),
            SmpResponse::Error { code, reason } => SmpResponse::Error { code, reason },
        }
    }
}

/// Human readable name of an mcumgr return code.
pub fn rc_name(rc: i64) -> &'static str {
    match rc {
        0 => "EOK",
        1 => "EUNKNOWN",
        2 => "ENOMEM",
        3 => "EINVAL",
        4 => "ETIMEOUT",
        5 => "ENOENT",
        6 => "EBADSTATE",
        7 => "EMSGSIZE",
        8 => "ENOTSUP",
        9 => "ECORRUPT",
        10 => "EBUSY",
        11 => "EACCESSDENIED",
        12 => "UNSUPPORTED_TOO_OLD",
        13 => "UNSUPPORTED_TOO_NEW",
        _ => "EPERUSER",
    }
}

#[derive(Debug, Default)]
struct UploadProgress {
    last_offset: Option<usize>,
}

pub struct SmpClient<T: Transport> {
    transport: T,
    timeout: Duration,
    next_seq: u8,
    /// Sequence numbers whose request timed out; late responses are dropped.
    abandoned: HashSet<u8>,
    upload: UploadProgress,
}

impl<T: Transport> SmpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            next_seq: 0,
            abandoned: HashSet::new(),
            upload: UploadProgress::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn open(&mut self) -> Result<()> {
        self.transport.open()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn take_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        // A reused sequence number belongs to the new request from now on.
        self.abandoned.remove(&seq);
        seq
    }

    /// Send a request and wait for the matching response payload.
    pub fn request(
        &mut self,
        op: Op,
        group: Group,
        id: u8,
        payload: &Value,
    ) -> Result<SmpResponse<Value>> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(payload, &mut body)
            .map_err(|err| SmpError::Cbor(err.to_string()))?;
        let len = u16::try_from(body.len())
            .map_err(|_| SmpError::Frame(format!("payload of {} bytes too long", body.len())))?;

        let seq = self.take_seq();
        let header = SmpHeader::request(op, group, id, seq, len);
        let mut packet = Vec::with_capacity(SMP_HEADER_LEN + body.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&body);

        log::debug!(
            "SMP request seq={seq} op={op:?} group={group:?} id={id} ({} bytes)",
            packet.len()
        );
        self.transport.send_frame(&packet)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.abandon(seq));
            }
            let frame = match self.transport.receive_frame(remaining) {
                Ok(frame) => frame,
                Err(SmpError::Timeout { .. }) => return Err(self.abandon(seq)),
                Err(err) => return Err(err),
            };

            let response = match SmpHeader::decode(&frame) {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("Dropping malformed SMP frame ({} bytes): {err}", frame.len());
                    continue;
                }
            };
            if !response.op.is_response() {
                log::debug!("Ignoring non-response SMP frame {response:?}");
                continue;
            }
            if response.seq != seq {
                if self.abandoned.remove(&response.seq) {
                    log::debug!("Discarding late response for seq={}", response.seq);
                } else {
                    log::warn!(
                        "Dropping unmatched SMP response seq={} (waiting for {seq})",
                        response.seq
                    );
                }
                continue;
            }

            let end = response.packet_len().min(frame.len());
            let payload: Value = if end > SMP_HEADER_LEN {
                ciborium::de::from_reader(&frame[SMP_HEADER_LEN..end])
                    .map_err(|err| SmpError::Cbor(err.to_string()))?
            } else {
                Value::Map(Vec::new())
            };
            return Ok(classify(payload));
        }
    }

    fn abandon(&mut self, seq: u8) -> SmpError {
        self.abandoned.insert(seq);
        SmpError::Timeout {
            seq,
            timeout_ms: self.timeout.as_millis(),
        }
    }

    /// Read the state of every image slot.
    pub fn image_states_read(&mut self) -> Result<SmpResponse<ImageStates>> {
        let response = self.request(
            Op::Read,
            Group::Image,
            header::image::STATE,
            &cbor_map([]),
        )?;
        match response {
            SmpResponse::Success(payload) => {
                Ok(SmpResponse::Success(ImageStates::from_value(&payload)?))
            }
            SmpResponse::Error { code, reason } => Ok(SmpResponse::Error { code, reason }),
        }
    }

    /// Mark an image for test (`confirm == false`) or confirm it permanently.
    pub fn image_state_write(
        &mut self,
        hash: Option<&[u8]>,
        confirm: bool,
    ) -> Result<SmpResponse<ImageStates>> {
        let mut entries = vec![(Value::Text("confirm".into()), Value::Bool(confirm))];
        if let Some(hash) = hash {
            entries.push((Value::Text("hash".into()), Value::Bytes(hash.to_vec())));
        }
        let response = self.request(
            Op::Write,
            Group::Image,
            header::image::STATE,
            &Value::Map(entries),
        )?;
        match response {
            SmpResponse::Success(payload) => {
                Ok(SmpResponse::Success(ImageStates::from_value(&payload)?))
            }
            SmpResponse::Error { code, reason } => Ok(SmpResponse::Error { code, reason }),
        }
    }

    /// Upload one chunk of an image. Returns the offset the device expects next.
    ///
    /// Offsets must increase from one call to the next; offset 0 starts a new
    /// upload.
    pub fn image_upload_write(
        &mut self,
        offset: usize,
        data: &[u8],
        total_len: usize,
    ) -> Result<SmpResponse<usize>> {
        if offset != 0 {
            if let Some(previous) = self.upload.last_offset {
                if offset <= previous {
                    return Err(SmpError::OffsetRegression { previous, offset });
                }
            }
        }

        let mut entries = vec![
            (Value::Text("off".into()), Value::Integer((offset as u64).into())),
            (Value::Text("data".into()), Value::Bytes(data.to_vec())),
        ];
        if offset == 0 {
            entries.push((Value::Text("image".into()), Value::Integer(0u64.into())));
            entries.push((
                Value::Text("len".into()),
                Value::Integer((total_len as u64).into()),
            ));
        }

        let response = self.request(
            Op::Write,
            Group::Image,
            header::image::UPLOAD,
            &Value::Map(entries),
        )?;
        self.upload.last_offset = Some(offset);

        Ok(response.map(|payload| {
            map_get(&payload, "off")
                .and_then(as_i64)
                .and_then(|off| usize::try_from(off).ok())
                .unwrap_or(offset + data.len())
        }))
    }

    /// Upload a complete image in chunks of `chunk_size` bytes.
    pub fn image_upload(&mut self, image: &[u8], chunk_size: usize) -> Result<SmpResponse<()>> {
        let chunk_size = chunk_size.max(1);
        self.upload.last_offset = None;
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(image.len());
            let next = match self.image_upload_write(offset, &image[offset..end], image.len())? {
                SmpResponse::Success(next) => next,
                SmpResponse::Error { code, reason } => {
                    return Ok(SmpResponse::Error { code, reason })
                }
            };
            log::debug!("Uploaded {next}/{} bytes", image.len());
            if next >= image.len() {
                return Ok(SmpResponse::Success(()));
            }
            if next <= offset {
                return Err(SmpError::Payload(format!(
                    "device did not advance past offset {offset}"
                )));
            }
            offset = next;
        }
    }

    /// Ask the device to echo `text` back.
    pub fn echo(&mut self, text: &str) -> Result<SmpResponse<String>> {
        let response = self.request(
            Op::Write,
            Group::Os,
            header::os::ECHO,
            &cbor_map([("d", Value::Text(text.to_string()))]),
        )?;
        match response {
            SmpResponse::Success(payload) => match map_get(&payload, "r").and_then(Value::as_text) {
                Some(echoed) => Ok(SmpResponse::Success(echoed.to_string())),
                None => Err(SmpError::Payload(format!(
                    "echo response without `r`: {payload:?}"
                ))),
            },
            SmpResponse::Error { code, reason } => Ok(SmpResponse::Error { code, reason }),
        }
    }

    pub fn os_reset(&mut self) -> Result<SmpResponse<()>> {
        let response = self.request(Op::Write, Group::Os, header::os::RESET, &cbor_map([]))?;
        Ok(response.map(|_| ()))
    }
}

impl<T: Transport> Drop for SmpClient<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Split a response payload into success or error.
///
/// SMP v1 reports failures through a non-zero `rc`; SMP v2 uses an
/// `err: { group, rc }` map.
fn classify(payload: Value) -> SmpResponse<Value> {
    if let Some(err) = map_get(&payload, "err") {
        let code = map_get(err, "rc").and_then(as_i64).unwrap_or(1);
        let group = map_get(err, "group").and_then(as_i64).unwrap_or(-1);
        return SmpResponse::Error {
            code,
            reason: format!("group {group} rc {code}"),
        };
    }
    match map_get(&payload, "rc").and_then(as_i64) {
        Some(rc) if rc != 0 => {
            let reason = map_get(&payload, "rsn")
                .and_then(Value::as_text)
                .map(str::to_string)
                .unwrap_or_else(|| rc_name(rc).to_string());
            SmpResponse::Error { code: rc, reason }
        }
        _ => SmpResponse::Success(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Transport that records sent frames and answers from a script.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl Transport for ScriptedTransport {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn receive_frame(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
            self.replies.pop_front().ok_or(SmpError::Timeout {
                seq: 0,
                timeout_ms: 0,
            })
        }
    }

    fn reply(op: Op, group: Group, id: u8, seq: u8, payload: &Value) -> Vec<u8> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(payload, &mut body).unwrap();
        let mut packet = SmpHeader::request(op, group, id, seq, body.len() as u16)
            .encode()
            .to_vec();
        packet.extend_from_slice(&body);
        packet
    }

    #[test]
    fn test_echo_round_trip() {
        let mut transport = ScriptedTransport::default();
        transport.replies.push_back(reply(
            Op::WriteRsp,
            Group::Os,
            header::os::ECHO,
            0,
            &cbor_map([("r", Value::Text("Hello world!".into()))]),
        ));
        let mut client = SmpClient::new(transport);

        let response = client.echo("Hello world!").unwrap();
        assert_eq!(response, SmpResponse::Success("Hello world!".to_string()));

        let sent = &client.transport().sent[0];
        let header = SmpHeader::decode(sent).unwrap();
        assert_eq!(header.op, Op::Write);
        assert_eq!(header.group, Group::Os);
        assert_eq!(header.seq, 0);
    }

    #[test]
    fn test_unmatched_and_late_responses_are_dropped() {
        // Nothing for the first request: it times out and seq 0 is abandoned.
        let mut client = SmpClient::new(ScriptedTransport::default());
        assert!(matches!(
            client.echo("first"),
            Err(SmpError::Timeout { seq: 0, .. })
        ));

        let echo = |seq, text: &str| {
            reply(
                Op::WriteRsp,
                Group::Os,
                header::os::ECHO,
                seq,
                &cbor_map([("r", Value::Text(text.into()))]),
            )
        };
        client.transport.replies.push_back(echo(0, "first"));
        client.transport.replies.push_back(echo(9, "stray"));
        client.transport.replies.push_back(echo(1, "second"));

        let response = client.echo("second").unwrap();
        assert_eq!(response, SmpResponse::Success("second".to_string()));
        assert!(client.abandoned.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut transport = ScriptedTransport::default();
        transport.replies.push_back(vec![0x03, 0x00]);
        transport.replies.push_back(reply(
            Op::WriteRsp,
            Group::Os,
            header::os::ECHO,
            0,
            &cbor_map([("r", Value::Text("still here".into()))]),
        ));
        let mut client = SmpClient::new(transport);

        let response = client.echo("still here").unwrap();
        assert_eq!(response, SmpResponse::Success("still here".to_string()));
    }

    #[test]
    fn test_negative_upload_offset_is_ignored() {
        let mut transport = ScriptedTransport::default();
        transport.replies.push_back(reply(
            Op::WriteRsp,
            Group::Image,
            header::image::UPLOAD,
            0,
            &cbor_map([("off", Value::Integer((-1i64).into()))]),
        ));
        let mut client = SmpClient::new(transport);

        let response = client.image_upload_write(0, b"1234", 8).unwrap();
        assert_eq!(response, SmpResponse::Success(4));
    }

    #[test]
    fn test_error_codes_are_reported() {
        let mut transport = ScriptedTransport::default();
        transport.replies.push_back(reply(
            Op::ReadRsp,
            Group::Image,
            header::image::STATE,
            0,
            &cbor_map([("rc", Value::Integer(8u64.into()))]),
        ));
        transport.replies.push_back(reply(
            Op::WriteRsp,
            Group::Os,
            header::os::ECHO,
            1,
            &cbor_map([(
                "err",
                cbor_map([
                    ("group", Value::Integer(0u64.into())),
                    ("rc", Value::Integer(3u64.into())),
                ]),
            )]),
        ));
        let mut client = SmpClient::new(transport);

        assert_eq!(
            client.image_states_read().unwrap(),
            SmpResponse::Error {
                code: 8,
                reason: "ENOTSUP".to_string()
            }
        );
        assert!(matches!(
            client.echo("x").unwrap(),
            SmpResponse::Error { code: 3, .. }
        ));
    }

    #[test]
    fn test_upload_offsets_must_advance() {
        let mut transport = ScriptedTransport::default();
        transport.replies.push_back(reply(
            Op::WriteRsp,
            Group::Image,
            header::image::UPLOAD,
            0,
            &cbor_map([
                ("rc", Value::Integer(0u64.into())),
                ("off", Value::Integer(3u64.into())),
            ]),
        ));
        let mut client = SmpClient::new(transport);

        let response = client.image_upload_write(0, b"123", 3).unwrap();
        assert_eq!(response, SmpResponse::Success(3));

        // The first chunk carries the total length.
        let sent: Value = ciborium::de::from_reader(&client.transport().sent[0][SMP_HEADER_LEN..]).unwrap();
        assert_eq!(map_get(&sent, "len").and_then(as_i64), Some(3));
        assert_eq!(
            map_get(&sent, "data").and_then(Value::as_bytes).cloned(),
            Some(b"123".to_vec())
        );

        client.upload.last_offset = Some(10);
        assert!(matches!(
            client.image_upload_write(5, b"x", 20),
            Err(SmpError::OffsetRegression {
                previous: 10,
                offset: 5
            })
        ));
    }
}
