//! Per-LUN execution context: run queue, dispatch loop, ordering and retry state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::abort;
use super::backpressure::RetryQueue;
use super::command::{Command, CommandId, Outcome};
use super::ordering::{Admission, OrderingSnapshot, OrderingState};
use super::session::SessionTable;
use super::unit::{Unit, UnitStatus};
use super::worker::{Work, WorkSender};
use crate::backstore::{BackingStore, BackstoreKind};
use crate::config::{DeviceConfig, EngineConfig};
use crate::scsi::TaskAttribute;

/// Counters kept per device.
#[derive(Default)]
pub struct DeviceStats {
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

/// Copy of [`DeviceStats`] at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl DeviceStats {
    pub(crate) fn record(&self, command: &Command, outcome: &Outcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Aborted => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Good { .. } | Outcome::TaskManagement(_) => {}
        }
        let (read, written) = command.bytes_transferred();
        self.read_bytes.fetch_add(read, Ordering::Relaxed);
        self.write_bytes.fetch_add(written, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_delivery(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A backing store attached at a LUN.
pub struct Device {
    lun: u64,
    name: String,
    store: Arc<dyn BackingStore>,
    block_size: u32,
    capacity: u64,
    max_transfer_blocks: u32,

    run_queue: Mutex<VecDeque<Arc<Unit>>>,
    run_notify: Notify,
    ordering: Mutex<OrderingState>,
    retry: RetryQueue,
    commands: Mutex<HashMap<CommandId, Arc<Command>>>,
    sessions: Arc<SessionTable>,
    stats: DeviceStats,

    work: WorkSender,
    runtime: Handle,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    pub(crate) fn new(
        lun: u64,
        store: Arc<dyn BackingStore>,
        config: &DeviceConfig,
        engine: &EngineConfig,
        work: WorkSender,
        runtime: Handle,
        sessions: Arc<SessionTable>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let advertised = store.max_transfer_blocks().max(1);
        let max_transfer_blocks = config
            .max_transfer_blocks
            .map_or(advertised, |limit| limit.clamp(1, advertised));
        let name = config.name.clone().unwrap_or_else(|| format!("lun{lun}"));
        Arc::new(Self {
            lun,
            name,
            block_size: store.block_size(),
            capacity: store.capacity(),
            max_transfer_blocks,
            store,
            run_queue: Mutex::new(VecDeque::new()),
            run_notify: Notify::new(),
            ordering: Mutex::new(OrderingState::default()),
            retry: RetryQueue::new(engine.retry_interval, engine.max_pending_deliveries),
            commands: Mutex::new(HashMap::new()),
            sessions,
            stats: DeviceStats::default(),
            work,
            runtime,
            shutdown,
            dispatcher: Mutex::new(None),
        })
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackstoreKind {
        self.store.kind()
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Capacity in logical blocks.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Largest unit handed to the backing store, in blocks.
    pub fn max_transfer_blocks(&self) -> u32 {
        self.max_transfer_blocks
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn ordering(&self) -> OrderingSnapshot {
        self.ordering.lock().snapshot()
    }

    /// Units waiting in the run queue.
    pub fn queued_units(&self) -> usize {
        self.run_queue.lock().len()
    }

    /// Commands waiting for a delivery retry.
    pub fn pending_deliveries(&self) -> usize {
        self.retry.len()
    }

    /// Commands submitted to this device that have not reached their terminal phase.
    pub fn active_commands(&self) -> Vec<Arc<Command>> {
        self.commands.lock().values().cloned().collect()
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub(crate) fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Hands work to the completion pool. Runs it in place once the pool is gone.
    pub(crate) fn post(&self, work: Work) {
        if let Err(err) = self.work.send(work) {
            debug!(lun = self.lun, "worker pool gone, completing inline");
            err.0.run();
        }
    }

    pub(crate) fn track(&self, command: &Arc<Command>) {
        self.commands.lock().insert(command.id(), Arc::clone(command));
    }

    pub(crate) fn untrack(&self, command: &Command) {
        self.commands.lock().remove(&command.id());
    }

    pub(crate) fn find_by_tag(&self, session: super::SessionId, tag: u64) -> Option<Arc<Command>> {
        self.commands
            .lock()
            .values()
            .find(|cmd| cmd.session_id() == session && cmd.tag() == tag)
            .cloned()
    }

    /// Runs a command through the ordering engine.
    pub(crate) fn admit(self: &Arc<Self>, command: &Arc<Command>) {
        let admission = self.ordering.lock().admit(command);
        match admission {
            Admission::Dispatch => self.release(command),
            Admission::Delayed => {
                debug!(cmd = %command.id(), lun = self.lun, attr = ?command.attribute(), "delayed");
                // A stop that ran before the command reached the delayed list
                // would not have found it there.
                if command.is_stop_requested() && self.withdraw(command) {
                    for unit in command.units() {
                        unit.complete(UnitStatus::aborted());
                    }
                }
            }
        }
    }

    /// Takes a command out of the delayed list. Returns whether it was there.
    pub(crate) fn withdraw(&self, command: &Command) -> bool {
        self.ordering.lock().withdraw(command.id()).is_some()
    }

    /// Accounts for a finished command and releases whatever it was holding back.
    pub(crate) fn finish_ordering(self: &Arc<Self>, command: &Command) {
        let released = self.ordering.lock().complete(command);
        for next in released {
            trace!(cmd = %next.id(), lun = self.lun, "released from delayed list");
            self.release(&next);
        }
    }

    fn release(self: &Arc<Self>, command: &Arc<Command>) {
        match command.task_management() {
            Some(function) => {
                let device = Arc::clone(self);
                let command = Arc::clone(command);
                self.runtime.spawn(async move {
                    abort::run_task_management(&device, &command, function).await;
                });
            }
            None => self.enqueue(
                command.units(),
                command.attribute() == TaskAttribute::HeadOfQueue,
            ),
        }
    }

    /// Appends units to the run queue, or puts them in front of it for head of
    /// queue commands.
    pub(crate) fn enqueue(&self, units: &[Arc<Unit>], head: bool) {
        {
            let mut queue = self.run_queue.lock();
            if head {
                for unit in units.iter().rev() {
                    unit.mark_queued();
                    queue.push_front(Arc::clone(unit));
                }
            } else {
                for unit in units {
                    unit.mark_queued();
                    queue.push_back(Arc::clone(unit));
                }
            }
        }
        self.run_notify.notify_one();
    }

    /// Removes every still queued unit of `command` from the run queue.
    pub(crate) fn dequeue(&self, command: CommandId) -> Vec<Arc<Unit>> {
        let mut queue = self.run_queue.lock();
        let mut removed = Vec::new();
        queue.retain(|unit| {
            if unit.command_id() == command {
                unit.clear_queued();
                removed.push(Arc::clone(unit));
                false
            } else {
                true
            }
        });
        removed
    }

    fn pop(&self) -> Option<Arc<Unit>> {
        let mut queue = self.run_queue.lock();
        let unit = queue.pop_front()?;
        unit.mark_dispatched();
        Some(unit)
    }

    pub(crate) fn start_dispatcher(self: &Arc<Self>) {
        let device = Arc::clone(self);
        let handle = self.runtime.spawn(async move { device.dispatch_loop().await });
        *self.dispatcher.lock() = Some(handle);
    }

    async fn dispatch_loop(self: Arc<Self>) {
        info!(lun = self.lun, name = %self.name, "dispatch loop started");
        loop {
            while let Some(unit) = self.pop() {
                self.dispatch(unit);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.run_notify.notified() => {}
            }
        }
        info!(lun = self.lun, "dispatch loop stopped");
    }

    fn dispatch(&self, unit: Arc<Unit>) {
        let Some(command) = unit.command() else {
            warn!(cmd = %unit.command_id(), "dropping unit of a released command");
            return;
        };
        if command.is_stop_requested() {
            trace!(cmd = %command.id(), unit = unit.index(), "stopped before start");
            unit.clear_dispatched();
            unit.complete(UnitStatus::aborted());
            return;
        }

        command.note_sent();
        trace!(
            cmd = %command.id(),
            unit = unit.index(),
            lba = unit.lba(),
            blocks = unit.blocks(),
            "execute"
        );
        if let Err(err) = self.store.execute(Arc::clone(&unit)) {
            warn!(cmd = %command.id(), unit = unit.index(), %err, "backing store rejected unit");
            unit.clear_dispatched();
            command.note_unsent();
            command.record_failure(err.clone());
            self.stop_siblings(&command, &unit);
            unit.complete(UnitStatus::Failed(err));
        }
    }

    /// Stops the rest of a command whose unit was rejected. Does not wait.
    fn stop_siblings(&self, command: &Command, rejected: &Arc<Unit>) {
        for unit in self.dequeue(command.id()) {
            unit.complete(UnitStatus::aborted());
        }
        for unit in command.units() {
            if Arc::ptr_eq(unit, rejected) || !unit.is_active() || unit.is_complete() {
                continue;
            }
            unit.mark_wants_stop();
            self.store.stop(unit);
        }
    }

    /// Stops the dispatch loop and waits for it to exit.
    pub(crate) async fn stop_dispatcher(&self) {
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(lun = self.lun, %err, "dispatch loop panicked");
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("lun", &self.lun)
            .field("name", &self.name)
            .field("kind", &self.store.kind())
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("max_transfer_blocks", &self.max_transfer_blocks)
            .finish()
    }
}
