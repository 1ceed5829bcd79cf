mod common;

use common::{Hook, LUN, RecordingFrontEnd, eventually, harness};
use lunaglass::engine::{CommandPhase, Outcome, UnitStatus};
use lunaglass::scsi::{
    AdditionalSense, TaskAttribute, TaskManagementFunction, TaskManagementResponse, command,
};
use lunaglass::{CommandRequest, ErrorKind};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lun_reset_stops_running_units() {
    let h = harness(64, 8);
    let other_frontend = RecordingFrontEnd::new();
    let other = h.engine.open_session(other_frontend.clone());

    let first = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::write10(0, 1)))
        .expect("first");
    let second = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::read10(1, 1)))
        .expect("second");
    eventually("both units running", || h.store.held().len() == 2).await;
    assert!(h.store.held().iter().all(|u| u.is_active()));

    let reset = h
        .engine
        .submit_task_management(&h.session, LUN, TaskManagementFunction::LogicalUnitReset)
        .expect("reset");
    eventually("reset answered", || h.frontend.outcome_of(reset.id()).is_some()).await;

    assert_eq!(
        h.frontend.outcome_of(reset.id()),
        Some(Outcome::TaskManagement(TaskManagementResponse::FunctionComplete))
    );
    assert_eq!(h.frontend.deliveries_for(reset.id())[0].hook, Hook::TaskManagement);
    assert_eq!(h.store.stops(), 2);
    assert_eq!(h.frontend.outcome_of(first.id()), Some(Outcome::Aborted));
    assert_eq!(other_frontend.outcome_of(second.id()), Some(Outcome::Aborted));
    assert_eq!(first.phase(), CommandPhase::Stopped);
    assert_eq!(h.device.stats().snapshot().aborted, 2);

    // The other session learns about the reset exactly once; INQUIRY does not
    // consume the condition.
    h.store.auto_complete(true);
    let inquiry = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::inquiry()));
    assert!(inquiry.is_ok());
    let err = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::test_unit_ready()))
        .expect_err("unit attention");
    assert_eq!(err.kind(), ErrorKind::UnitAttention);
    assert_eq!(err.additional_sense(), AdditionalSense::POWER_ON_RESET);
    assert!(
        h.engine
            .submit(&other, CommandRequest::new(LUN, command::test_unit_ready()))
            .is_ok()
    );
    // The initiator of the reset gets none.
    assert!(
        h.engine
            .submit(&h.session, CommandRequest::new(LUN, command::test_unit_ready()))
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_stopped_before_start_never_reaches_the_store() {
    let h = harness(64, 8);
    let blocker = h
        .engine
        .submit(
            &h.session,
            CommandRequest::new(LUN, command::write10(0, 1)).attribute(TaskAttribute::Ordered),
        )
        .expect("blocker");
    eventually("blocker running", || h.store.held_for(blocker.id()) == 1).await;

    let victim = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::read10(4, 2)).tag(42))
        .expect("victim");
    assert_eq!(h.device.ordering().delayed, 1);

    let abort = h
        .engine
        .submit_task_management(&h.session, LUN, TaskManagementFunction::AbortTask { tag: 42 })
        .expect("abort");
    eventually("abort answered", || h.frontend.outcome_of(abort.id()).is_some()).await;

    assert_eq!(
        h.frontend.outcome_of(abort.id()),
        Some(Outcome::TaskManagement(TaskManagementResponse::FunctionComplete))
    );
    assert_eq!(h.frontend.outcome_of(victim.id()), Some(Outcome::Aborted));
    assert_eq!(h.store.executed_for(victim.id()), 0);
    assert_eq!(victim.units_sent(), 0);
    assert_eq!(h.device.ordering().delayed, 0);

    h.store.complete(blocker.id(), UnitStatus::Good);
    eventually("blocker delivered", || h.frontend.outcome_of(blocker.id()).is_some()).await;
    assert_eq!(h.store.executed_for(victim.id()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_task_for_unknown_tag() {
    let h = harness(64, 8);
    let abort = h
        .engine
        .submit_task_management(&h.session, LUN, TaskManagementFunction::AbortTask { tag: 7 })
        .expect("abort");
    eventually("abort answered", || h.frontend.outcome_of(abort.id()).is_some()).await;
    assert_eq!(
        h.frontend.outcome_of(abort.id()),
        Some(Outcome::TaskManagement(TaskManagementResponse::TaskDoesNotExist))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_task_set_leaves_other_sessions_alone() {
    let h = harness(64, 8);
    let other_frontend = RecordingFrontEnd::new();
    let other = h.engine.open_session(other_frontend.clone());

    let mine = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::write10(0, 1)))
        .expect("mine");
    let theirs = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::write10(1, 1)))
        .expect("theirs");
    eventually("both running", || h.store.held().len() == 2).await;

    let abort = h
        .engine
        .submit_task_management(&h.session, LUN, TaskManagementFunction::AbortTaskSet)
        .expect("abort task set");
    eventually("abort answered", || h.frontend.outcome_of(abort.id()).is_some()).await;

    assert_eq!(h.frontend.outcome_of(mine.id()), Some(Outcome::Aborted));
    assert_eq!(h.store.held_for(theirs.id()), 1);
    assert!(other_frontend.deliveries().is_empty());
    assert!(!other.has_unit_attention(LUN));

    h.store.complete(theirs.id(), UnitStatus::Good);
    eventually("theirs delivered", || other_frontend.outcome_of(theirs.id()).is_some()).await;
    assert!(other_frontend.outcome_of(theirs.id()).is_some_and(|o| o.is_good()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_task_set_tells_the_other_initiators() {
    let h = harness(64, 8);
    let other_frontend = RecordingFrontEnd::new();
    let other = h.engine.open_session(other_frontend.clone());

    let theirs = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::write10(1, 1)))
        .expect("theirs");
    eventually("running", || h.store.held_for(theirs.id()) == 1).await;

    let clear = h
        .engine
        .submit_task_management(&h.session, LUN, TaskManagementFunction::ClearTaskSet)
        .expect("clear task set");
    eventually("clear answered", || h.frontend.outcome_of(clear.id()).is_some()).await;

    assert_eq!(other_frontend.outcome_of(theirs.id()), Some(Outcome::Aborted));
    h.store.auto_complete(true);
    let err = h
        .engine
        .submit(&other, CommandRequest::new(LUN, command::read10(0, 1)))
        .expect_err("unit attention");
    assert_eq!(
        err.additional_sense(),
        AdditionalSense::COMMANDS_CLEARED_BY_ANOTHER_INITIATOR
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detach_aborts_outstanding_commands() {
    let h = harness(64, 8);
    let running = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::write10(0, 1)))
        .expect("submit");
    eventually("running", || h.store.held_for(running.id()) == 1).await;

    h.engine.detach_device(LUN).await.expect("detach");
    assert_eq!(h.frontend.outcome_of(running.id()), Some(Outcome::Aborted));
    assert!(h.engine.device(LUN).is_none());
    let err = h
        .engine
        .submit(&h.session, CommandRequest::new(LUN, command::test_unit_ready()))
        .expect_err("detached");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
