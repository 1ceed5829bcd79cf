mod common;

use common::{Harness, LUN, eventually, harness};
use lunaglass::CommandRequest;
use lunaglass::engine::{Command, UnitStatus};
use lunaglass::scsi::{TaskAttribute, command};
use std::sync::Arc;

fn submit(h: &Harness, lba: u32, attribute: TaskAttribute) -> Arc<Command> {
    h.engine
        .submit(
            &h.session,
            CommandRequest::new(LUN, command::write10(lba, 1)).attribute(attribute),
        )
        .expect("submit")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordered_waits_for_older_simple_and_holds_back_younger() {
    let h = harness(64, 8);
    let a = submit(&h, 0, TaskAttribute::Simple);
    eventually("A at the store", || h.store.held_for(a.id()) == 1).await;

    let b = submit(&h, 1, TaskAttribute::Ordered);
    let c = submit(&h, 2, TaskAttribute::Simple);
    let ordering = h.device.ordering();
    assert_eq!(ordering.delayed, 2);
    assert_eq!(ordering.simple_outstanding, 1);
    assert_eq!(h.store.executed_for(b.id()), 0);
    assert_eq!(h.store.executed_for(c.id()), 0);

    h.store.complete(a.id(), UnitStatus::Good);
    eventually("B at the store", || h.store.held_for(b.id()) == 1).await;
    assert_eq!(h.store.executed_for(c.id()), 0, "C must wait for B");
    assert_eq!(h.device.ordering().ordered_outstanding, 1);

    h.store.complete(b.id(), UnitStatus::Good);
    eventually("C at the store", || h.store.held_for(c.id()) == 1).await;
    h.store.complete(c.id(), UnitStatus::Good);

    eventually("all delivered", || h.frontend.deliveries().len() == 3).await;
    assert_eq!(h.frontend.delivered_ids(), vec![a.id(), b.id(), c.id()]);
    assert!(a.order_id() < b.order_id() && b.order_id() < c.order_id());
    assert_eq!(h.device.ordering().cursor, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordered_runs_at_once_when_nothing_is_outstanding() {
    let h = harness(64, 8);
    let a = submit(&h, 0, TaskAttribute::Simple);
    eventually("A at the store", || h.store.held_for(a.id()) == 1).await;
    h.store.complete(a.id(), UnitStatus::Good);
    eventually("A delivered", || h.frontend.outcome_of(a.id()).is_some()).await;

    let b = submit(&h, 1, TaskAttribute::Ordered);
    eventually("B at the store", || h.store.held_for(b.id()) == 1).await;

    let c = submit(&h, 2, TaskAttribute::Simple);
    assert_eq!(h.device.ordering().delayed, 1);
    assert_eq!(h.store.executed_for(c.id()), 0);

    h.store.complete(b.id(), UnitStatus::Good);
    eventually("C at the store", || h.store.held_for(c.id()) == 1).await;
    h.store.complete_all();
    eventually("all delivered", || h.frontend.deliveries().len() == 3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simple_commands_overlap() {
    let h = harness(64, 8);
    let a = submit(&h, 0, TaskAttribute::Simple);
    let b = submit(&h, 1, TaskAttribute::Simple);
    eventually("both at the store", || {
        h.store.held_for(a.id()) == 1 && h.store.held_for(b.id()) == 1
    })
    .await;
    assert_eq!(h.device.ordering().simple_outstanding, 2);

    // Completion order does not have to follow submission order.
    h.store.complete(b.id(), UnitStatus::Good);
    eventually("B delivered", || h.frontend.outcome_of(b.id()).is_some()).await;
    h.store.complete(a.id(), UnitStatus::Good);
    eventually("A delivered", || h.frontend.outcome_of(a.id()).is_some()).await;
    assert_eq!(h.frontend.delivered_ids(), vec![b.id(), a.id()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn head_of_queue_skips_the_delayed_list() {
    let h = harness(64, 8);
    let a = submit(&h, 0, TaskAttribute::Simple);
    eventually("A at the store", || h.store.held_for(a.id()) == 1).await;
    let b = submit(&h, 1, TaskAttribute::Ordered);
    let hoq = submit(&h, 2, TaskAttribute::HeadOfQueue);

    eventually("head of queue at the store", || h.store.held_for(hoq.id()) == 1).await;
    assert_eq!(h.store.executed_for(b.id()), 0);

    h.store.complete(hoq.id(), UnitStatus::Good);
    h.store.complete(a.id(), UnitStatus::Good);
    eventually("B at the store", || h.store.held_for(b.id()) == 1).await;
    h.store.complete_all();
    eventually("all delivered", || h.frontend.deliveries().len() == 3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordered_never_overlaps_anything() {
    let h = harness(64, 8);
    let attributes = [
        TaskAttribute::Simple,
        TaskAttribute::Ordered,
        TaskAttribute::Simple,
        TaskAttribute::Simple,
        TaskAttribute::Ordered,
        TaskAttribute::Ordered,
        TaskAttribute::Simple,
    ];
    let commands: Vec<_> = attributes
        .iter()
        .enumerate()
        .map(|(i, attr)| submit(&h, i as u32, *attr))
        .collect();

    let mut delivered = 0;
    while delivered < commands.len() {
        eventually("something at the store", || !h.store.held().is_empty()).await;
        let held = h.store.held();
        let ordered_held = held
            .iter()
            .filter(|u| {
                commands
                    .iter()
                    .any(|c| c.id() == u.command_id() && c.attribute() == TaskAttribute::Ordered)
            })
            .count();
        if ordered_held > 0 {
            assert_eq!(held.len(), 1, "ordered command ran alongside another");
        }
        for unit in &held {
            h.store.complete(unit.command_id(), UnitStatus::Good);
        }
        delivered += held.len();
        eventually("deliveries", || h.frontend.deliveries().len() >= delivered).await;
    }

    let ids: Vec<_> = commands.iter().map(|c| c.id()).collect();
    let order = h.frontend.delivered_ids();
    // Ordered commands split the stream into groups that never mix.
    let position = |id| order.iter().position(|d| *d == id).expect("delivered");
    assert!(position(ids[0]) < position(ids[1]));
    assert!(position(ids[1]) < position(ids[2]) && position(ids[1]) < position(ids[3]));
    assert!(position(ids[3]) < position(ids[4]) && position(ids[2]) < position(ids[4]));
    assert!(position(ids[4]) < position(ids[5]));
    assert!(position(ids[5]) < position(ids[6]));
}
