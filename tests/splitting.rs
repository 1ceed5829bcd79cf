mod common;

use std::sync::Arc;

use common::{Hook, LUN, eventually, harness};
use lunaglass::engine::{Outcome, UnitStatus};
use lunaglass::scsi::response::{Response, inquiry_response, read_capacity_response};
use lunaglass::scsi::{AdditionalSense, Direction, ScsiStatus, SenseKey, command};
use lunaglass::{
    CommandRequest, DeviceConfig, Engine, EngineConfig, ErrorKind, RamdiskStore, ScatterList,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ten_blocks_with_max_four_become_three_units() {
    let h = harness(1000, 4);
    let cmd = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::read10(100, 10)))
        .expect("submit");
    assert_eq!(cmd.units_expected(), 3);

    eventually("three units at the store", || h.store.held().len() == 3).await;
    let ranges: Vec<_> = h
        .store
        .executed()
        .iter()
        .map(|e| (e.lba, e.lba + u64::from(e.blocks)))
        .collect();
    assert_eq!(ranges, vec![(100, 104), (104, 108), (108, 110)]);
    assert_eq!(cmd.units_sent(), 3);

    h.store.complete_all();
    eventually("delivery", || h.frontend.deliveries().len() == 1).await;
    let delivery = &h.frontend.deliveries()[0];
    assert_eq!(delivery.hook, Hook::Data);
    assert!(delivery.outcome.is_good());
    assert_eq!(cmd.bytes_transferred(), (10 * 512, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_violation_fails_before_any_unit() {
    let h = harness(105, 4);
    let err = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::read10(100, 10)))
        .expect_err("beyond capacity");

    assert_eq!(err.kind(), ErrorKind::CapacityViolation);
    assert_eq!(err.status(), ScsiStatus::CheckCondition);
    let sense = err.sense();
    assert_eq!(sense.sense_key(), Some(SenseKey::IllegalRequest));
    assert_eq!(sense.additional_sense(), Some(AdditionalSense::LBA_OUT_OF_RANGE));

    assert!(h.store.executed().is_empty());
    assert!(h.frontend.deliveries().is_empty());
    assert_eq!(h.session.live_commands(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_transfer_completes_without_the_store() {
    let h = harness(64, 4);
    let cmd = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::write10(8, 0)))
        .expect("submit");

    assert_eq!(cmd.units_expected(), 0);
    assert_eq!(h.device.queued_units(), 0);
    eventually("delivered", || h.frontend.outcome_of(cmd.id()).is_some()).await;
    assert!(cmd.is_terminal());
    assert!(h.store.executed().is_empty());
    assert_eq!(
        h.frontend.outcome_of(cmd.id()),
        Some(Outcome::Good {
            residual: Default::default()
        })
    );
    // Delivered from the worker pool, not from inside `submit`.
    let delivery = &h.frontend.deliveries_for(cmd.id())[0];
    assert_ne!(delivery.thread, std::thread::current().id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn misaligned_expected_length_is_rejected() {
    let h = harness(64, 4);
    let err = h
        .engine
        .submit(
            &h.session,
            CommandRequest::new(LUN, command::write10(0, 2)).expected_length(1000),
        )
        .expect_err("misaligned");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(h.store.executed().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_opcode_is_rejected() {
    let h = harness(64, 4);
    let cdb = lunaglass::scsi::CommandBlock::from_bytes(&[0x04, 0, 0, 0, 0, 0]).expect("cdb");
    let err = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, cdb))
        .expect_err("FORMAT UNIT is not supported");
    assert_eq!(
        err.sense().additional_sense(),
        Some(AdditionalSense::INVALID_COMMAND_OPERATION_CODE)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_lun_is_rejected() {
    let h = harness(64, 4);
    let err = h
        .engine
        .submit(&h.session, CommandRequest::new(7, command::test_unit_ready()))
        .expect_err("no lun 7");
    assert_eq!(
        err.sense().additional_sense(),
        Some(AdditionalSense::LOGICAL_UNIT_NOT_SUPPORTED)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bidirectional_commands_split_per_direction() {
    let h = harness(64, 2);
    let cmd = h
        .engine
        .submit(
            &h.session,
            CommandRequest::new(LUN, command::write10(0, 3))
                .data(ScatterList::zeroed(3 * 512, 512))
                .bidirectional(ScatterList::zeroed(3 * 512, 512)),
        )
        .expect("submit");

    assert_eq!(cmd.units_expected(), 4);
    let directions: Vec<_> = cmd.units().iter().map(|u| u.direction()).collect();
    assert_eq!(
        directions,
        vec![
            Direction::DataOut,
            Direction::DataOut,
            Direction::DataIn,
            Direction::DataIn
        ]
    );

    eventually("all units at the store", || h.store.held().len() == 4).await;
    h.store.complete_all();
    eventually("delivery", || h.frontend.deliveries().len() == 1).await;
    assert_eq!(h.frontend.deliveries()[0].hook, Hook::Data);
    assert_eq!(cmd.bytes_transferred(), (3 * 512, 3 * 512));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_unit_stops_its_siblings() {
    let h = harness(1000, 4);
    h.store.reject_at(104);
    let cmd = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::read10(100, 10)))
        .expect("submit");

    eventually("delivery", || h.frontend.deliveries().len() == 1).await;
    match h.frontend.outcome_of(cmd.id()) {
        Some(Outcome::Failed(err)) => assert_eq!(err.kind(), ErrorKind::CommunicationFailure),
        other => panic!("unexpected outcome {other:?}"),
    }
    // The first unit was running and got stopped, the third never started.
    assert_eq!(h.store.executed_for(cmd.id()), 2);
    assert_eq!(h.store.stops(), 1);
    assert!(h.store.held().is_empty());
    assert_eq!(cmd.units_sent(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_unit_fails_the_command() {
    let h = harness(64, 1);
    let cmd = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::write10(0, 2)))
        .expect("submit");
    eventually("units at the store", || h.store.held().len() == 2).await;

    let medium = lunaglass::EngineError::new(ErrorKind::Medium);
    h.store.complete(cmd.id(), UnitStatus::Failed(medium));
    eventually("delivery", || h.frontend.deliveries().len() == 1).await;

    let delivery = &h.frontend.deliveries()[0];
    assert_eq!(delivery.hook, Hook::Status);
    assert_eq!(delivery.outcome.status(), ScsiStatus::CheckCondition);
    assert_eq!(cmd.sense().sense_key(), Some(SenseKey::MediumError));
    assert_eq!(h.device.stats().snapshot().failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ramdisk_round_trip_across_segments() {
    let engine = Engine::start(EngineConfig::default()).expect("engine");
    let store = RamdiskStore::new(512, 128).expect("ramdisk").with_max_transfer_blocks(3);
    let device = engine
        .attach_device(0, Arc::new(store), DeviceConfig::default())
        .expect("attach");
    let frontend = common::RecordingFrontEnd::new();
    let session = engine.open_session(frontend.clone());

    let pattern: Vec<u8> = (0..10 * 512).map(|i| (i % 253) as u8).collect();
    // Segments deliberately straddle unit boundaries.
    let segments: Vec<Vec<u8>> = pattern.chunks(700).map(<[u8]>::to_vec).collect();
    let write = engine
        .submit(
            &session,
            CommandRequest::new(0, command::write10(20, 10))
                .data(ScatterList::from_segments(segments)),
        )
        .expect("write");
    eventually("write delivered", || frontend.outcome_of(write.id()).is_some()).await;
    assert!(frontend.outcome_of(write.id()).is_some_and(|o| o.is_good()));

    let read = engine
        .submit(&session, CommandRequest::new(0, command::read10(20, 10)))
        .expect("read");
    eventually("read delivered", || frontend.outcome_of(read.id()).is_some()).await;
    let data = frontend.deliveries_for(read.id())[0].data.clone();
    assert_eq!(data.as_deref(), Some(pattern.as_slice()));

    let stats = device.stats().snapshot();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.read_bytes, 10 * 512);
    assert_eq!(stats.write_bytes, 10 * 512);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ramdisk_answers_control_commands() {
    let engine = Engine::start(EngineConfig::default()).expect("engine");
    let store = RamdiskStore::new(4096, 32).expect("ramdisk");
    engine
        .attach_device(0, Arc::new(store), DeviceConfig::default())
        .expect("attach");
    let frontend = common::RecordingFrontEnd::new();
    let session = engine.open_session(frontend.clone());

    let inquiry = engine
        .submit(&session, CommandRequest::new(0, command::inquiry()))
        .expect("inquiry");
    let capacity = engine
        .submit(&session, CommandRequest::new(0, command::read_capacity()))
        .expect("read capacity");
    eventually("both delivered", || frontend.deliveries().len() == 2).await;

    let data = frontend.deliveries_for(inquiry.id())[0].data.clone().expect("inquiry data");
    match inquiry_response(&data).expect("parse") {
        Response::Inquiry(inquiry) => assert_eq!(&inquiry.vendor, b"LUNAGLAS"),
        _ => panic!("not inquiry data"),
    }
    let data = frontend.deliveries_for(capacity.id())[0].data.clone().expect("capacity data");
    match read_capacity_response(&data).expect("parse") {
        Response::ReadCapacity(capacity) => {
            assert_eq!(capacity.last_lba, 31);
            assert_eq!(capacity.block_size, 4096);
        }
        _ => panic!("not capacity data"),
    }

    engine.shutdown().await;
}
