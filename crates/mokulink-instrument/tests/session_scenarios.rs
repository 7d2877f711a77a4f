use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mokulink_instrument::{
    encode_frame, Channel, Frontend, FrontendConfig, FrameHeader, MokuError, Oscilloscope,
    Session, SessionConfig, SignalGenerator, SineWave, Synthesizer, XMode,
};
use mokulink_transport::mock::{MockHandle, MockTransport};
use mokulink_transport::{DatalogCommand, DatalogState, DatalogStorage};

fn config() -> SessionConfig {
    SessionConfig {
        frame_poll_interval: Duration::from_millis(5),
        commit_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn session() -> (Session, MockHandle) {
    let (mock, handle) = MockTransport::new();
    (Session::new(Box::new(mock), config()).unwrap(), handle)
}

fn scope_frame(frame_id: u16, sample: i32) -> Bytes {
    let header = FrameHeader {
        frame_id,
        instrument_id: 1,
        ..FrameHeader::default()
    };
    encode_frame(&header, &[vec![Some(sample); 8], vec![None; 8]]).unwrap()
}

fn wait_until_drained(handle: &MockHandle) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.pending_frames() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(30));
}

#[test]
fn get_frame_times_out_within_bounds() {
    let (session, _handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();

    let started = Instant::now();
    let err = scope.get_frame(Duration::from_millis(100)).unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, MokuError::FrameTimeout(_)));
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(1), "returned after {waited:?}");
}

#[test]
fn identical_payloads_decode_identically() {
    let (session, handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();

    handle.push_frame(scope_frame(1, 123));
    let first = scope.get_frame(Duration::from_secs(2)).unwrap();
    handle.push_frame(scope_frame(1, 123));
    let second = scope.get_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.samples_per_channel(), 8);
    assert!(first.channel(Channel::Ch2).unwrap().iter().all(Option::is_none));
}

#[test]
fn commit_rescales_frames_and_drops_stale_ones() {
    let (mock, handle) = MockTransport::new();
    handle.set_property("calibration.AG-1M-L-D-1", "100");
    let session = Session::new(Box::new(mock), config()).unwrap();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();

    handle.push_frame(scope_frame(1, 200));
    let frame = scope.get_frame(Duration::from_secs(2)).unwrap();
    let volts = frame.channel(Channel::Ch1).unwrap()[0].unwrap();
    assert!((volts - 2.0).abs() < 1e-9, "got {volts}");

    handle.push_frame(scope_frame(2, 200));
    wait_until_drained(&handle);
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
    scope.commit().unwrap();

    let err = scope.get_frame(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, MokuError::FrameTimeout(_)), "stale frame delivered");

    handle.push_frame(scope_frame(3, 200));
    let frame = scope.get_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.header.frame_id, 3);
    assert_eq!(frame.channel(Channel::Ch1).unwrap()[0], Some(200.0));
}

#[test]
fn malformed_frame_is_reported_and_stream_continues() {
    let (session, handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();

    handle.push_frame(Bytes::from_static(&[0x00, 0x01, 0x02]));
    let err = scope.get_frame(Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, MokuError::Stream(_)));

    handle.push_frame(scope_frame(9, 1));
    let frame = scope.get_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.header.frame_id, 9);
}

#[test]
fn attaching_again_invalidates_the_old_controller() {
    let (session, handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();
    let sg = session.attach_instrument(SignalGenerator::new()).unwrap();

    assert_eq!(handle.deploy_count(), 2);
    assert_eq!(handle.deployed_instrument(), Some(4));
    assert_eq!(session.instrument_name(), Some("signal_generator"));
    assert!(!scope.is_attached());
    assert!(sg.is_attached());

    let err = scope
        .configure(|osc| osc.set_xmode(XMode::Roll))
        .unwrap_err();
    assert!(matches!(err, MokuError::NotDeployed));
    assert!(matches!(scope.commit(), Err(MokuError::NotDeployed)));
    assert!(matches!(
        scope.get_frame(Duration::from_millis(10)),
        Err(MokuError::NotDeployed)
    ));

    sg.configure(|sg| sg.synth_sinewave(Channel::Ch1, SineWave::new(1.0, 1e3)))
        .unwrap();
    sg.commit().unwrap();
}

#[test]
fn refused_deploy_leaves_nothing_attached() {
    let (session, handle) = session();
    handle.fail_next_deploy(7);
    let err = session
        .attach_instrument(Oscilloscope::new())
        .err()
        .unwrap();
    assert!(matches!(err, MokuError::Deploy(ref m) if m.contains("code 7")));
    assert_eq!(session.instrument_name(), None);
    assert!(matches!(session.commit(), Err(MokuError::NotDeployed)));

    session.attach_instrument(Oscilloscope::new()).unwrap();
    assert_eq!(session.instrument_name(), Some("oscilloscope"));
}

#[test]
fn detach_and_close() {
    let (session, handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();
    session.detach_instrument().unwrap();
    assert!(!scope.is_attached());
    assert_eq!(session.instrument_name(), None);

    let sg = session.attach_instrument(SignalGenerator::new()).unwrap();
    session.close().unwrap();
    assert!(handle.is_closed());
    assert!(session.is_closed());
    assert!(matches!(
        sg.configure(|sg| sg.enable_output(Channel::Ch2, true)),
        Err(MokuError::InvalidOperation(_))
    ));
    assert!(matches!(
        session.detach_instrument(),
        Err(MokuError::InvalidOperation(_))
    ));
    session.close().unwrap();
}

#[test]
fn datalogger_rides_in_the_next_commit() {
    let (session, handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();

    let err = scope
        .configure(|osc| osc.datalogger_start(Duration::from_secs(5), [true, false], false))
        .unwrap_err();
    assert!(matches!(err, MokuError::InvalidOperation(_)));

    scope
        .configure(|osc| {
            osc.set_xmode(XMode::Roll)?;
            osc.set_samplerate(10e3)?;
            osc.datalogger_start(Duration::from_secs(5), [true, true], false)
        })
        .unwrap();
    scope.commit().unwrap();

    let txn = handle.last_transaction().unwrap();
    match txn.datalog {
        DatalogCommand::Start(settings) => {
            assert_eq!(settings.channels, [true, true]);
            assert_eq!(settings.storage, DatalogStorage::Internal);
            assert_eq!(settings.duration, Duration::from_secs(5));
        }
        other => panic!("expected a datalogger start, got {other:?}"),
    }
    assert_eq!(scope.datalogger_status().unwrap().state, DatalogState::Running);

    scope.configure(|osc| osc.datalogger_stop()).unwrap();
    scope.commit().unwrap();
    assert_eq!(handle.last_transaction().unwrap().datalog, DatalogCommand::Stop);
    assert_eq!(session.datalogger_status().unwrap().state, DatalogState::Idle);

    scope.commit().unwrap();
    assert_eq!(
        handle.last_transaction().unwrap().datalog,
        DatalogCommand::Unchanged
    );
}

#[test]
fn frontend_readback_follows_commit() {
    let (session, _handle) = session();
    let scope = session.attach_instrument(Oscilloscope::new()).unwrap();
    let ac = FrontendConfig {
        ac_coupled: true,
        ..FrontendConfig::default()
    };
    scope.configure(|osc| osc.set_frontend(Channel::Ch2, ac)).unwrap();
    assert_eq!(scope.read(|osc| osc.frontend(Channel::Ch2)).unwrap(), ac);
    scope.commit().unwrap();
    assert_eq!(scope.read(|osc| osc.frontend(Channel::Ch2)).unwrap(), ac);
}
