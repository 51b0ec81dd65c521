mod common;

use std::{net::UdpSocket, thread, time::Duration};

use anyhow::Result;
use twister_harness::{
    fixtures::{parse_config, Session},
    smp::{
        header::{image, os},
        Group, Op, SmpHeader, SmpResponse, Value, SMP_HEADER_LEN,
    },
};

fn get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

fn text_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

fn slot(slot: u64, version: &str, hash: &[u8], active: bool) -> Value {
    text_map(vec![
        ("image", Value::Integer(0u64.into())),
        ("slot", Value::Integer(slot.into())),
        ("version", Value::Text(version.to_string())),
        ("hash", Value::Bytes(hash.to_vec())),
        ("bootable", Value::Bool(true)),
        ("active", Value::Bool(active)),
        ("confirmed", Value::Bool(active)),
    ])
}

/// Minimal mcumgr server: echo, image upload and image state read.
///
/// The secondary slot reports the uploaded bytes as its "hash".
fn spawn_mcumgr_server() -> Result<(String, thread::JoinHandle<()>)> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(Duration::from_secs(10)))?;
    let address = socket.local_addr()?.to_string();

    let handle = thread::spawn(move || {
        let mut uploaded: Vec<u8> = Vec::new();
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf) {
            let Ok(header) = SmpHeader::decode(&buf[..len]) else {
                continue;
            };
            let request: Value = ciborium::de::from_reader(&buf[SMP_HEADER_LEN..len])
                .unwrap_or(Value::Map(Vec::new()));

            let (op, payload) = match (header.group, header.id) {
                (Group::Os, os::ECHO) => (
                    Op::WriteRsp,
                    text_map(vec![(
                        "r",
                        get(&request, "d").cloned().unwrap_or(Value::Null),
                    )]),
                ),
                (Group::Image, image::UPLOAD) => {
                    let off = get(&request, "off")
                        .and_then(Value::as_integer)
                        .and_then(|i| u64::try_from(i).ok())
                        .unwrap_or(0) as usize;
                    let data = get(&request, "data")
                        .and_then(Value::as_bytes)
                        .cloned()
                        .unwrap_or_default();
                    if off == 0 {
                        uploaded.clear();
                    }
                    uploaded.extend_from_slice(&data);
                    (
                        Op::WriteRsp,
                        text_map(vec![(
                            "off",
                            Value::Integer((uploaded.len() as u64).into()),
                        )]),
                    )
                }
                (Group::Image, image::STATE) => {
                    let mut images = vec![slot(0, "1.0.0", b"running", true)];
                    if !uploaded.is_empty() {
                        images.push(slot(1, "1.0.1", &uploaded, false));
                    }
                    (Op::ReadRsp, text_map(vec![("images", Value::Array(images))]))
                }
                _ => (
                    Op::WriteRsp,
                    text_map(vec![("rc", Value::Integer(8u64.into()))]),
                ),
            };

            let mut body = Vec::new();
            if ciborium::ser::into_writer(&payload, &mut body).is_err() {
                continue;
            }
            let response = SmpHeader {
                op,
                len: body.len() as u16,
                ..header
            };
            let mut packet = response.encode().to_vec();
            packet.extend_from_slice(&body);
            if socket.send_to(&packet, peer).is_err() {
                break;
            }
        }
    });
    Ok((address, handle))
}

fn udp_session(address: &str) -> Result<Session> {
    let udp_arg = format!("--mcumgr-udp-addr={address}");
    let config = parse_config([
        "--twister-harness",
        "--device-type=custom",
        "--binary-file=/bin/cat",
        "--mcumgr-transport=udp",
        udp_arg.as_str(),
        "--mcumgr-timeout=2",
    ])?
    .expect("harness enabled");
    Ok(Session::new(config)?)
}

#[test]
fn test_echo_round_trip_over_udp() -> Result<()> {
    let (address, _server) = spawn_mcumgr_server()?;
    let mut session = udp_session(&address)?;
    let dut = session.dut("test_echo")?;
    let mut mcumgr = dut.mcumgr()?;

    match mcumgr.echo("Hello world!")? {
        SmpResponse::Success(echoed) => assert_eq!(echoed, "Hello world!"),
        other => panic!("echo failed: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_image_upload_and_state_read() -> Result<()> {
    let (address, _server) = spawn_mcumgr_server()?;
    let mut session = udp_session(&address)?;
    let dut = session.dut("test_upload")?;
    let mut mcumgr = dut.mcumgr()?;

    let before = mcumgr.image_states_read()?.success().expect("state read");
    let primary_version = before.primary().expect("primary slot").version.clone();
    assert!(before.secondary().is_none());

    let next = mcumgr.image_upload_write(0, b"123", 3)?;
    assert_eq!(next.success(), Some(3));

    let after = mcumgr.image_states_read()?.success().expect("state read");
    assert_eq!(after.primary().expect("primary slot").version, primary_version);
    assert_eq!(after.secondary().expect("secondary slot").hash, b"123");

    // Chunked upload of a larger image ends with the same bytes on the device.
    let firmware: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    assert!(mcumgr.image_upload(&firmware, 128)?.is_success());
    let after = mcumgr.image_states_read()?.success().expect("state read");
    assert_eq!(after.secondary().expect("secondary slot").hash, firmware);
    Ok(())
}
