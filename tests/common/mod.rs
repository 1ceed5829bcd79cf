#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use lunaglass::engine::{Command, CommandId, Device, Outcome, Session, Unit, UnitStatus};
use lunaglass::{
    BackingStore, BackstoreKind, DeliveryError, DeviceConfig, Engine, EngineConfig, EngineError,
    EngineResult, FrontEnd,
};
use parking_lot::Mutex;

/// One `execute` call seen by [`HeldStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executed {
    pub cmd: CommandId,
    pub lba: u64,
    pub blocks: u32,
}

/// Backing store that keeps every unit until the test completes it.
pub struct HeldStore {
    block_size: u32,
    capacity: u64,
    max_transfer_blocks: u32,
    held: Mutex<Vec<Arc<Unit>>>,
    executed: Mutex<Vec<Executed>>,
    reject_lba: Mutex<Option<u64>>,
    auto_complete: AtomicBool,
    stops: AtomicUsize,
}

impl HeldStore {
    pub fn new(capacity: u64, max_transfer_blocks: u32) -> Arc<Self> {
        Arc::new(Self {
            block_size: 512,
            capacity,
            max_transfer_blocks,
            held: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            reject_lba: Mutex::new(None),
            auto_complete: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        })
    }

    /// Completes units with GOOD status as soon as they arrive.
    pub fn auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// Rejects the unit starting at `lba` synchronously.
    pub fn reject_at(&self, lba: u64) {
        *self.reject_lba.lock() = Some(lba);
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    pub fn executed_for(&self, cmd: CommandId) -> usize {
        self.executed.lock().iter().filter(|e| e.cmd == cmd).count()
    }

    pub fn held(&self) -> Vec<Arc<Unit>> {
        self.held.lock().clone()
    }

    pub fn held_for(&self, cmd: CommandId) -> usize {
        self.held.lock().iter().filter(|u| u.command_id() == cmd).count()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Completes every held unit of `cmd`.
    pub fn complete(&self, cmd: CommandId, status: UnitStatus) {
        let units: Vec<_> = {
            let mut held = self.held.lock();
            let (matching, rest) = held.drain(..).partition(|u| u.command_id() == cmd);
            *held = rest;
            matching
        };
        for unit in units {
            unit.complete(status.clone());
        }
    }

    pub fn complete_all(&self) {
        let units: Vec<_> = self.held.lock().drain(..).collect();
        for unit in units {
            unit.complete(UnitStatus::Good);
        }
    }
}

impl BackingStore for HeldStore {
    fn kind(&self) -> BackstoreKind {
        BackstoreKind::Block
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn max_transfer_blocks(&self) -> u32 {
        self.max_transfer_blocks
    }

    fn execute(&self, unit: Arc<Unit>) -> EngineResult<()> {
        self.executed.lock().push(Executed {
            cmd: unit.command_id(),
            lba: unit.lba(),
            blocks: unit.blocks(),
        });
        if *self.reject_lba.lock() == Some(unit.lba()) {
            return Err(EngineError::communication_failure("store offline"));
        }
        let finish = {
            let mut held = self.held.lock();
            if unit.wants_stop() {
                Some(UnitStatus::aborted())
            } else if self.auto_complete.load(Ordering::SeqCst) {
                Some(UnitStatus::Good)
            } else {
                held.push(Arc::clone(&unit));
                None
            }
        };
        if let Some(status) = finish {
            unit.complete(status);
        }
        Ok(())
    }

    fn stop(&self, unit: &Arc<Unit>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let removed = {
            let mut held = self.held.lock();
            let position = held.iter().position(|u| Arc::ptr_eq(u, unit));
            position.map(|p| held.remove(p))
        };
        if let Some(unit) = removed {
            unit.complete(UnitStatus::aborted());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    Data,
    Status,
    TaskManagement,
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub cmd: CommandId,
    pub hook: Hook,
    pub outcome: Outcome,
    pub data: Option<Vec<u8>>,
    /// Thread the hook ran on.
    pub thread: ThreadId,
}

/// Front end that records what it is given and can pretend to be busy.
#[derive(Default)]
pub struct RecordingFrontEnd {
    deliveries: Mutex<Vec<Delivery>>,
    released: Mutex<Vec<CommandId>>,
    busy_remaining: AtomicUsize,
    busy_returned: AtomicUsize,
}

impl RecordingFrontEnd {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers the next `count` deliveries with [`DeliveryError::Busy`].
    pub fn set_busy(&self, count: usize) {
        self.busy_remaining.store(count, Ordering::SeqCst);
    }

    pub fn busy_returned(&self) -> usize {
        self.busy_returned.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn delivered_ids(&self) -> Vec<CommandId> {
        self.deliveries.lock().iter().map(|d| d.cmd).collect()
    }

    pub fn deliveries_for(&self, cmd: CommandId) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.cmd == cmd)
            .cloned()
            .collect()
    }

    pub fn outcome_of(&self, cmd: CommandId) -> Option<Outcome> {
        self.deliveries_for(cmd).first().map(|d| d.outcome.clone())
    }

    pub fn released(&self) -> Vec<CommandId> {
        self.released.lock().clone()
    }

    fn record(&self, command: &Arc<Command>, hook: Hook) -> Result<(), DeliveryError> {
        let busy = self
            .busy_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            self.busy_returned.fetch_add(1, Ordering::SeqCst);
            return Err(DeliveryError::Busy);
        }
        let data = match hook {
            Hook::Data => command.read_data(),
            _ => None,
        };
        self.deliveries.lock().push(Delivery {
            cmd: command.id(),
            hook,
            outcome: command.outcome().expect("delivered before terminal phase"),
            data,
            thread: thread::current().id(),
        });
        Ok(())
    }
}

impl FrontEnd for RecordingFrontEnd {
    fn deliver_data(&self, command: &Arc<Command>) -> Result<(), DeliveryError> {
        self.record(command, Hook::Data)
    }

    fn deliver_status(&self, command: &Arc<Command>) -> Result<(), DeliveryError> {
        self.record(command, Hook::Status)
    }

    fn deliver_task_management_response(
        &self,
        command: &Arc<Command>,
    ) -> Result<(), DeliveryError> {
        self.record(command, Hook::TaskManagement)
    }

    fn release_command(&self, command: &Arc<Command>) {
        self.released.lock().push(command.id());
    }
}

pub struct Harness {
    pub engine: Engine,
    pub device: Arc<Device>,
    pub store: Arc<HeldStore>,
    pub frontend: Arc<RecordingFrontEnd>,
    pub session: Arc<Session>,
}

pub const LUN: u64 = 0;

/// Engine with one [`HeldStore`] at [`LUN`] and one session. Must run inside a
/// tokio runtime.
pub fn harness(capacity: u64, max_transfer_blocks: u32) -> Harness {
    harness_with(EngineConfig::default(), capacity, max_transfer_blocks)
}

pub fn harness_with(config: EngineConfig, capacity: u64, max_transfer_blocks: u32) -> Harness {
    let engine = Engine::start(config).expect("engine start");
    let store = HeldStore::new(capacity, max_transfer_blocks);
    let device = engine
        .attach_device(LUN, store.clone(), DeviceConfig::named("held"))
        .expect("attach");
    let frontend = RecordingFrontEnd::new();
    let session = engine.open_session(frontend.clone());
    Harness {
        engine,
        device,
        store,
        frontend,
        session,
    }
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
