//! End-to-end session scenarios against a scripted mock outstation

mod support;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::timeout;

use support::MockOutstation;
use voltage_iec104::{
    ApciType, Asdu, Cause, CauseOfTransmission, ConnectionState, Iec104Error, Iec104Session,
    InformationObject, TypeId, UFunction, Value, QOI_STATION,
};

async fn connected_session(outstation: &MockOutstation, config: voltage_iec104::Iec104Config) -> (Iec104Session, support::Peer) {
    let session = Iec104Session::new("test-rtu", config).unwrap();
    let (connected, peer) = tokio::join!(session.connect(), outstation.accept());
    connected.unwrap();
    (session, peer)
}

async fn active_session(
    outstation: &MockOutstation,
    config: voltage_iec104::Iec104Config,
) -> (Iec104Session, support::Peer) {
    let (session, mut peer) = connected_session(outstation, config).await;
    let (started, _) = tokio::join!(session.start_data_transfer(), async {
        peer.serve_startdt().await;
    });
    started.unwrap();
    assert_eq!(session.state(), ConnectionState::Active);
    (session, peer)
}

async fn wait_for_disconnect(session: &Iec104Session, wait: Duration) {
    let Some(mut watch) = session.state_watch() else {
        return;
    };
    timeout(wait, async move {
        loop {
            if *watch.borrow() == ConnectionState::Disconnected {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("disconnect deadline");
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

/// Scenario: happy-path startup. Connect plus STARTDT handshake leaves the
/// session in Active with clean windows.
#[tokio::test]
async fn happy_path_startup() {
    support::init_tracing();
    let outstation = MockOutstation::bind().await;
    let (session, peer) = active_session(&outstation, outstation.config()).await;

    let diag = session.diagnostics();
    assert_eq!(diag["state"], "active");
    assert_eq!(diag["queue_len"], "0");

    session.disconnect().await;
    peer.shutdown();
}

/// Scenario: interrogation cycle. The activation confirmation, the data and
/// the activation termination arrive in on-wire order through the queue, and
/// the w window forces an S-frame acknowledgment.
#[tokio::test]
async fn interrogation_cycle_delivers_in_order() {
    let outstation = MockOutstation::bind().await;
    let mut config = outstation.config();
    config.w = 2;
    let (session, mut peer) = active_session(&outstation, config).await;

    session.send_interrogation(1, QOI_STATION).await.unwrap();

    let (apdu, request) = peer.read_i_frame().await;
    assert_eq!(
        apdu.apci,
        ApciType::IFrame {
            send_seq: 0,
            recv_seq: 0
        }
    );
    assert_eq!(request.type_id, TypeId::InterrogationCommand);
    assert_eq!(request.cot.cause, Cause::Activation);
    assert_eq!(request.objects[0].ioa, 0);
    assert_eq!(request.objects[0].value, Value::Qualifier(QOI_STATION));

    // peer replies: activation confirmation, one measurement ASDU, termination
    peer.send_i(&Asdu::new(
        TypeId::InterrogationCommand,
        Cause::ActivationCon,
        1,
        vec![InformationObject::new(0, Value::Qualifier(QOI_STATION))],
    ))
    .await;
    peer.send_i(&Asdu::new(
        TypeId::MeasuredNormalized,
        Cause::InterrogatedByStation,
        1,
        vec![
            InformationObject::new(100, Value::Normalized(0.5)),
            InformationObject::new(101, Value::Normalized(0.25)),
            InformationObject::new(102, Value::Normalized(-0.75)),
        ],
    ))
    .await;
    peer.send_i(&Asdu::new(
        TypeId::InterrogationCommand,
        Cause::ActivationTerm,
        1,
        vec![InformationObject::new(0, Value::Qualifier(QOI_STATION))],
    ))
    .await;

    // w = 2, so the second received I-frame forces an S-frame
    assert!(
        peer.saw_frame_matching(Duration::from_secs(2), |apdu| matches!(
            apdu.apci,
            ApciType::SFrame { .. }
        ))
        .await,
        "expected an S-frame acknowledgment"
    );

    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while received.len() < 3 && tokio::time::Instant::now() < deadline {
        received.extend(session.dequeue_received_asdus());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(received.len(), 3);
    assert_eq!(received[0].cot.cause, Cause::ActivationCon);
    assert_eq!(received[1].type_id, TypeId::MeasuredNormalized);
    let ioas: Vec<u32> = received[1].objects.iter().map(|o| o.ioa).collect();
    assert_eq!(ioas, vec![100, 101, 102]);
    assert_eq!(received[2].cot.cause, Cause::ActivationTerm);

    session.disconnect().await;
    peer.shutdown();
}

/// Scenario: window enforcement. With k = 3 and no acknowledgments the
/// fourth send refuses with WindowFull; an S-frame re-opens the window.
#[tokio::test]
async fn window_enforcement_with_k_three() {
    let outstation = MockOutstation::bind().await;
    let mut config = outstation.config();
    config.k = 3;
    config.w = 2;
    config.t1_ms = 30_000; // keep t1 out of the way while the peer withholds acks
    config.t2_ms = 200;
    let (session, mut peer) = active_session(&outstation, config).await;

    let command = |ioa: u32| {
        Asdu::new(
            TypeId::SingleCommand,
            Cause::Activation,
            1,
            vec![InformationObject::new(ioa, Value::Bool(true))],
        )
    };

    for ioa in 1..=3 {
        session.send_asdu(command(ioa), false).await.unwrap();
    }
    assert_eq!(
        session.send_asdu(command(4), false).await.unwrap_err(),
        Iec104Error::WindowFull
    );

    // the peer acknowledges the first two frames
    peer.send_s(2).await;

    let mut accepted = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !accepted && tokio::time::Instant::now() < deadline {
        match session.send_asdu(command(4), false).await {
            Ok(()) => accepted = true,
            Err(Iec104Error::WindowFull) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(accepted, "window did not reopen after the S-frame");

    session.disconnect().await;
    peer.shutdown();
}

/// Scenario: t1 timeout. An unacknowledged I-frame kills the session and
/// subsequent API calls fail.
#[tokio::test]
async fn t1_timeout_disconnects() {
    let outstation = MockOutstation::bind().await;
    let mut config = outstation.config();
    config.t1_ms = 400;
    config.t2_ms = 200;
    let (session, peer) = active_session(&outstation, config).await;

    session.send_interrogation(1, QOI_STATION).await.unwrap();
    // the peer never acknowledges
    wait_for_disconnect(&session, Duration::from_secs(3)).await;

    let err = session.send_interrogation(1, QOI_STATION).await.unwrap_err();
    assert!(
        matches!(
            err,
            Iec104Error::Disconnected(_) | Iec104Error::NoSession(_)
        ),
        "{err:?}"
    );
    peer.shutdown();
}

/// Scenario: test frame on idle. t3 of silence triggers a TESTFR
/// activation; the confirmation keeps the session Active.
#[tokio::test]
async fn idle_line_sends_test_frame() {
    let outstation = MockOutstation::bind().await;
    let mut config = outstation.config();
    config.t3_ms = 300;
    config.t1_ms = 2_000;
    config.t2_ms = 200;
    let (session, mut peer) = active_session(&outstation, config).await;

    peer.expect_u(UFunction::TestFrAct).await;
    peer.send_u(UFunction::TestFrCon).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), ConnectionState::Active);

    // the probe repeats after another idle t3
    peer.expect_u(UFunction::TestFrAct).await;
    peer.send_u(UFunction::TestFrCon).await;
    assert_eq!(session.state(), ConnectionState::Active);

    session.disconnect().await;
    peer.shutdown();
}

/// Scenario: sequence violation. An I-frame skipping one N(S) gets no
/// acknowledgment; the engine closes the socket with SequenceError.
#[tokio::test]
async fn sequence_violation_disconnects() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    // skip N(S)=0 by pretending one frame was already sent
    peer.send_seq = 1;
    peer.send_i(&Asdu::new(
        TypeId::SinglePoint,
        Cause::Spontaneous,
        1,
        vec![InformationObject::new(10, Value::Bool(true))],
    ))
    .await;

    wait_for_disconnect(&session, Duration::from_secs(3)).await;
    assert!(session.dequeue_received_asdus().is_empty());
    peer.shutdown();
}

/// A negative activation confirmation surfaces as CommandRejected; a
/// positive one completes the command.
#[tokio::test]
async fn command_confirmation_positive_and_negative() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    // positive confirmation
    let (result, _) = tokio::join!(
        session.send_command(1, 200, TypeId::SingleCommand, Value::Bool(true), false),
        async {
            let (_, request) = peer.read_i_frame().await;
            assert_eq!(request.type_id, TypeId::SingleCommand);
            assert!(!request.objects[0].select);
            peer.send_i(&Asdu::new(
                TypeId::SingleCommand,
                Cause::ActivationCon,
                1,
                vec![InformationObject::new(200, Value::Bool(true))],
            ))
            .await;
        }
    );
    result.unwrap();

    // negative confirmation
    let (result, _) = tokio::join!(
        session.send_command(1, 201, TypeId::SingleCommand, Value::Bool(false), false),
        async {
            let (_, request) = peer.read_i_frame().await;
            let cot = CauseOfTransmission {
                cause: Cause::ActivationCon,
                test: false,
                negative: true,
            };
            let reply = Asdu::new(
                TypeId::SingleCommand,
                cot,
                1,
                vec![InformationObject::new(201, Value::Bool(false))],
            );
            peer.send_i(&reply).await;
        }
    );
    assert!(
        matches!(result.unwrap_err(), Iec104Error::CommandRejected(_)),
        "expected CommandRejected"
    );

    session.disconnect().await;
    peer.shutdown();
}

/// The select flag sets the S/E bit on the wire.
#[tokio::test]
async fn select_then_execute_sets_qualifier_bit() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    let (result, _) = tokio::join!(
        session.send_command(1, 300, TypeId::SingleCommand, Value::Bool(true), true),
        async {
            let (_, request) = peer.read_i_frame().await;
            assert!(request.objects[0].select, "S/E bit not set");
            peer.send_i(&Asdu::new(
                TypeId::SingleCommand,
                Cause::ActivationCon,
                1,
                vec![InformationObject::new(300, Value::Bool(true)).with_select(true)],
            ))
            .await;
        }
    );
    result.unwrap();

    session.disconnect().await;
    peer.shutdown();
}

/// STOPDT returns the session to Connected, where data sends are refused.
#[tokio::test]
async fn stopdt_returns_to_connected() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    let (stopped, _) = tokio::join!(session.stop_data_transfer(), async {
        peer.expect_u(UFunction::StopDtAct).await;
        peer.send_u(UFunction::StopDtCon).await;
    });
    stopped.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    let err = session.send_interrogation(1, QOI_STATION).await.unwrap_err();
    assert_eq!(err, Iec104Error::NotActive);

    session.disconnect().await;
    peer.shutdown();
}

/// The session-level test frame completes against a confirming peer.
#[tokio::test]
async fn manual_test_frame_round_trip() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    let (result, _) = tokio::join!(session.send_test_frame(), async {
        peer.expect_u(UFunction::TestFrAct).await;
        peer.send_u(UFunction::TestFrCon).await;
    });
    result.unwrap();

    session.disconnect().await;
    peer.shutdown();
}

/// The engine answers a peer-initiated TESTFR with the confirmation.
#[tokio::test]
async fn peer_test_frame_is_confirmed() {
    let outstation = MockOutstation::bind().await;
    let (session, mut peer) = active_session(&outstation, outstation.config()).await;

    peer.send_u(UFunction::TestFrAct).await;
    peer.expect_u(UFunction::TestFrCon).await;

    session.disconnect().await;
    peer.shutdown();
}
