//! A session over a real `DeviceLink`, talking to a scripted device on a
//! local socket.

use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mokulink::device::{
    ControlMessage, DeployRequest, DeployResponse, LinkConfig, PropertiesReply, CONTROL_CLOSE,
    CONTROL_DEPLOY, CONTROL_PROPERTIES,
};
use mokulink::instrument::{encode_frame, FrameHeader};
use mokulink::transport::DeviceStream;
use mokulink::wire::{PacketReader, PacketWriter, CONTROL, DATA, REGISTERS};
use mokulink::{
    connect_with, Channel, Frontend, FrontendConfig, MokuError, Oscilloscope, SessionConfig,
};

type Writer = PacketWriter<DeviceStream>;

fn scope_frame(frame_id: u16, sample: i32) -> Vec<u8> {
    let header = FrameHeader {
        frame_id,
        instrument_id: 1,
        ..FrameHeader::default()
    };
    encode_frame(&header, &[vec![Some(sample); 8], vec![None; 8]])
        .unwrap()
        .to_vec()
}

fn control_reply(writer: &mut Writer, request: &[u8]) -> bool {
    let msg = ControlMessage::from_bytes(request).unwrap();
    let reply = match msg.msg_type.as_str() {
        CONTROL_DEPLOY => {
            let request: DeployRequest = msg.into_payload(CONTROL_DEPLOY).unwrap();
            let response = DeployResponse {
                protocol: request.protocol,
                version: request.version,
                instrument_id: request.instrument_id,
                status: 0,
                bitstream_version: 1,
            };
            ControlMessage::with_payload(CONTROL_DEPLOY, &response).unwrap()
        }
        CONTROL_PROPERTIES => {
            let reply = PropertiesReply {
                status: 0,
                entries: vec![
                    ("calibration.AG-1M-L-D-1".into(), "100".into()),
                    ("calibration.AG-1M-H-D-1".into(), "10".into()),
                ],
            };
            ControlMessage::with_payload(CONTROL_PROPERTIES, &reply).unwrap()
        }
        CONTROL_CLOSE => return false,
        other => panic!("unexpected control request {other}"),
    };
    writer.send(CONTROL, &reply.to_bytes().unwrap()).unwrap();
    true
}

/// Serve one connection. `on_write` runs for every register write and
/// must send the acknowledgement itself.
fn device<F>(on_write: F) -> (std::net::SocketAddr, JoinHandle<()>)
where
    F: FnMut(&mut Writer) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut on_write = on_write;
        let (stream, _) = listener.accept().unwrap();
        let stream = DeviceStream::from_tcp(stream);
        let mut reader = PacketReader::new(stream.try_clone().unwrap());
        let mut writer = PacketWriter::new(stream);
        while let Ok(packet) = reader.read_packet() {
            match packet.channel {
                CONTROL => {
                    if !control_reply(&mut writer, &packet.payload) {
                        return;
                    }
                }
                REGISTERS => on_write(&mut writer),
                other => panic!("unexpected request on channel {other}"),
            }
        }
    });
    (addr, handle)
}

fn config(poll: Duration) -> SessionConfig {
    SessionConfig {
        frame_poll_interval: poll,
        apply_defaults: false,
        sync_on_attach: false,
        ..SessionConfig::default()
    }
}

#[test]
fn frame_sent_before_the_ack_is_never_delivered() {
    let (addr, device) = device(|writer| {
        writer.send(DATA, &scope_frame(77, 200)).unwrap();
        writer.send(REGISTERS, &[0x47, 0, 0]).unwrap();
        thread::sleep(Duration::from_millis(300));
        writer.send(DATA, &scope_frame(78, 200)).unwrap();
    });

    let poll = Duration::from_millis(5);
    let session = connect_with(addr, LinkConfig::default(), config(poll)).unwrap();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();
    scope
        .configure(|osc| {
            osc.set_frontend(
                Channel::Ch1,
                FrontendConfig {
                    attenuate: false,
                    ..FrontendConfig::default()
                },
            )
        })
        .unwrap();
    let receipt = scope.commit().unwrap();
    assert_eq!(receipt.epoch, 1);

    let err = scope.get_frame(Duration::from_millis(100)).unwrap_err();
    assert!(
        matches!(err, MokuError::FrameTimeout(_)),
        "frame from before the acknowledgement was delivered: {err:?}"
    );

    let frame = scope.get_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.header.frame_id, 78);
    let volts = frame.channel(Channel::Ch1).unwrap()[0].unwrap();
    assert!((volts - 20.0).abs() < 1e-9, "decoded with stale scaling: {volts}");

    session.close().unwrap();
    device.join().unwrap();
}

#[test]
fn detach_stops_a_stream_blocked_on_the_socket() {
    let (addr, device) = device(|writer| writer.send(REGISTERS, &[0x47, 0, 0]).unwrap());
    let poll = Duration::from_millis(200);

    let session = connect_with(addr, LinkConfig::default(), config(poll)).unwrap();
    let _scope = session.attach_instrument(Oscilloscope::new()).unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    session.detach_instrument().unwrap();
    let took = started.elapsed();
    assert!(took < poll + Duration::from_millis(150), "stop took {took:?}");

    session.close().unwrap();
    device.join().unwrap();
}
