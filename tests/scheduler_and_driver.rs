//! Interrogation scheduling, reconnect supervision and the tag driver,
//! exercised against a scripted mock outstation

mod support;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use support::MockOutstation;
use voltage_iec104::{
    Asdu, BackoffPolicy, BlockConfig, BlockScheduler, Cause, ConnectionState, DeviceConfig,
    Iec104Driver, Iec104Session, InformationObject, SessionSupervisor, TypeId, Value,
};

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let stop = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < stop {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn float_asdu(ca: u16, objects: Vec<(u32, f32)>, cause: Cause) -> Asdu {
    Asdu::new(
        TypeId::MeasuredFloat,
        cause,
        ca,
        objects
            .into_iter()
            .map(|(ioa, v)| InformationObject::new(ioa, Value::Float(v)))
            .collect(),
    )
}

#[tokio::test]
async fn interrogation_cycle_fills_block_cache() {
    let outstation = MockOutstation::bind().await;
    let session = Arc::new(Iec104Session::new("sched", outstation.config()).unwrap());

    let (connected, mut peer) = tokio::join!(session.connect(), outstation.accept());
    connected.unwrap();
    let (started, _) = tokio::join!(session.start_data_transfer(), async {
        peer.serve_startdt().await;
    });
    started.unwrap();

    let scheduler = Arc::new(BlockScheduler::new(
        Arc::clone(&session),
        vec![BlockConfig::parse("1-20-1-1000//true").unwrap()],
    ));
    let block = scheduler.blocks()[0].clone();

    let (cycle, _) = tokio::join!(scheduler.run_interrogation(&block), async {
        let (_, request) = peer.read_i_frame().await;
        assert_eq!(request.type_id, TypeId::InterrogationCommand);

        peer.send_i(&Asdu::new(
            TypeId::InterrogationCommand,
            Cause::ActivationCon,
            1,
            vec![InformationObject::new(0, Value::Qualifier(20))],
        ))
        .await;
        peer.send_i(&float_asdu(
            1,
            vec![(100, 42.5), (101, 1.25), (102, -0.75)],
            Cause::InterrogatedByStation,
        ))
        .await;
        peer.send_i(&Asdu::new(
            TypeId::InterrogationCommand,
            Cause::ActivationTerm,
            1,
            vec![InformationObject::new(0, Value::Qualifier(20))],
        ))
        .await;
    });
    cycle.unwrap();

    assert_eq!(block.cache().len(), 3);
    assert_eq!(
        block.cache().get(100).unwrap().object.value,
        Value::Float(42.5)
    );
    assert_eq!(
        block.stats().cycles.load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // spontaneous delivery outside any interrogation window
    peer.send_i(&float_asdu(1, vec![(150, 7.5)], Cause::Spontaneous))
        .await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            scheduler.ingest_pending();
            block.cache().get(150).is_some()
        })
        .await,
        "spontaneous object not cached"
    );
    assert!(
        block
            .stats()
            .spontaneous
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );

    // ASDUs for other common addresses are consumed but not cached
    peer.send_i(&float_asdu(9, vec![(160, 3.0)], Cause::Spontaneous))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.ingest_pending();
    assert!(block.cache().get(160).is_none());
    assert!(session.dequeue_received_asdus().is_empty());

    session.disconnect().await;
    peer.shutdown();
}

#[tokio::test]
async fn interrogation_without_termination_times_out() {
    let outstation = MockOutstation::bind().await;
    let session = Arc::new(Iec104Session::new("sched-to", outstation.config()).unwrap());

    let (connected, mut peer) = tokio::join!(session.connect(), outstation.accept());
    connected.unwrap();
    let (started, _) = tokio::join!(session.start_data_transfer(), async {
        peer.serve_startdt().await;
    });
    started.unwrap();

    let mut config = BlockConfig::parse("1-20-1-1000//true").unwrap();
    config.response_timeout_ms = 300;
    let scheduler = Arc::new(BlockScheduler::new(Arc::clone(&session), vec![config]));
    let block = scheduler.blocks()[0].clone();

    let (cycle, _) = tokio::join!(scheduler.run_interrogation(&block), async {
        // swallow the interrogation, answer with data but never terminate
        let _ = peer.read_i_frame().await;
        peer.send_i(&float_asdu(1, vec![(100, 1.0)], Cause::InterrogatedByStation))
            .await;
    });
    cycle.unwrap();

    // the data that did arrive is cached; the cycle counts as a timeout
    assert_eq!(block.cache().len(), 1);
    assert_eq!(
        block.stats().timeouts.load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    session.disconnect().await;
    peer.shutdown();
}

#[tokio::test]
async fn supervisor_reconnects_after_session_death() {
    let outstation = MockOutstation::bind().await;
    let session = Arc::new(Iec104Session::new("supervised", outstation.config()).unwrap());

    let supervisor = SessionSupervisor::new(
        Arc::clone(&session),
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        },
    );
    let shutdown = supervisor.shutdown_token();
    let task = supervisor.spawn();

    // first connection
    let mut peer = outstation.accept().await;
    peer.serve_startdt().await;
    assert!(
        wait_until(Duration::from_secs(3), || session.is_active()).await,
        "first session never became active"
    );

    // kill it; the supervisor reconnects with a fresh engine
    peer.shutdown();
    let mut peer = outstation.accept().await;
    peer.serve_startdt().await;
    assert!(
        wait_until(Duration::from_secs(3), || session.is_active()).await,
        "session did not come back after reconnect"
    );

    shutdown.cancel();
    let _ = task.await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    peer.shutdown();
}

#[tokio::test]
async fn driver_reads_and_writes_tags_end_to_end() {
    support::init_tracing();
    let outstation = MockOutstation::bind().await;

    let device = DeviceConfig::new("rtu-e2e", outstation.config())
        .with_block_string("1-20-1-1000//true")
        .unwrap();

    let driver = Iec104Driver::new();
    driver.register_device(device).unwrap();
    driver.register_tag("rtu-e2e", "meas", "1.100.13").unwrap();
    driver.register_tag("rtu-e2e", "breaker", "1.300.45").unwrap();

    // the supervisor connects and starts data transfer on its own
    let mut peer = outstation.accept().await;
    peer.serve_startdt().await;

    // the scheduler's station interrogation follows immediately
    let (_, request) = peer.read_i_frame().await;
    assert_eq!(request.type_id, TypeId::InterrogationCommand);
    peer.send_i(&float_asdu(
        1,
        vec![(100, 42.5)],
        Cause::InterrogatedByStation,
    ))
    .await;
    peer.send_i(&Asdu::new(
        TypeId::InterrogationCommand,
        Cause::ActivationTerm,
        1,
        vec![InformationObject::new(0, Value::Qualifier(20))],
    ))
    .await;

    assert!(
        wait_until(Duration::from_secs(3), || driver.read_tag("meas").is_ok()).await,
        "tag never became readable"
    );
    let reading = driver.read_tag("meas").unwrap();
    assert_eq!(reading.value, Value::Float(42.5));
    assert!(reading.quality.is_good());
    assert_eq!(reading.cause, Cause::InterrogatedByStation);

    // write path: single command to IOA 300, confirmed by the peer
    let (write, _) = tokio::join!(driver.write_tag("breaker", Value::Bool(true)), async {
        let (_, request) = peer.read_i_frame().await;
        assert_eq!(request.type_id, TypeId::SingleCommand);
        assert_eq!(request.objects[0].ioa, 300);
        peer.send_i(&Asdu::new(
            TypeId::SingleCommand,
            Cause::ActivationCon,
            1,
            vec![InformationObject::new(300, Value::Bool(true))],
        ))
        .await;
    });
    write.unwrap();

    driver.remove_device("rtu-e2e").await.unwrap();
    assert!(driver.read_tag("meas").is_err());
    peer.shutdown();
}
