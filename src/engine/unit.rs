//! Units: the execution-sized fragments a command is split into.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tracing::{trace, warn};

use super::buffer::BufferView;
use super::command::{Command, CommandId};
use super::worker::Work;
use crate::error::EngineError;
use crate::scsi::{DecodedCdb, Direction};

const QUEUED: u8 = 1 << 0;
const ACTIVE: u8 = 1 << 1;
const SENT: u8 = 1 << 2;
const WANTS_STOP: u8 = 1 << 3;
const COMPLETE: u8 = 1 << 4;

/// Result a backing store reports for one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    Good,
    Failed(EngineError),
}

impl UnitStatus {
    pub fn aborted() -> Self {
        UnitStatus::Failed(EngineError::aborted())
    }
}

/// Where a unit sits in its command's transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitExtent {
    /// First logical block. Meaningless for control commands.
    pub lba: u64,
    pub blocks: u32,
    /// Byte offset of this unit within its half of the transfer.
    pub offset: usize,
    pub len: usize,
}

/// One piece of a command handed to a backing store.
///
/// A backing store receives `Arc<Unit>` from [`BackingStore::execute`](crate::BackingStore::execute)
/// and must call [`Unit::complete`] exactly once, from any thread, at any later time.
pub struct Unit {
    command: Weak<Command>,
    command_id: CommandId,
    index: usize,
    cdb: Option<DecodedCdb>,
    direction: Direction,
    extent: UnitExtent,
    view: BufferView,
    flags: AtomicU8,
    done: Notify,
}

impl Unit {
    pub(crate) fn new(
        command: Weak<Command>,
        command_id: CommandId,
        index: usize,
        cdb: Option<DecodedCdb>,
        direction: Direction,
        extent: UnitExtent,
        view: BufferView,
    ) -> Arc<Self> {
        Arc::new(Self {
            command,
            command_id,
            index,
            cdb,
            direction,
            extent,
            view,
            flags: AtomicU8::new(0),
            done: Notify::new(),
        })
    }

    pub fn command(&self) -> Option<Arc<Command>> {
        self.command.upgrade()
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Position within the command's unit list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The decoded CDB of the owning command.
    pub fn cdb(&self) -> Option<&DecodedCdb> {
        self.cdb.as_ref()
    }

    /// [`Direction::DataIn`] or [`Direction::DataOut`] for data units; bidirectional
    /// commands have one unit list per direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn extent(&self) -> UnitExtent {
        self.extent
    }

    pub fn lba(&self) -> u64 {
        self.extent.lba
    }

    pub fn blocks(&self) -> u32 {
        self.extent.blocks
    }

    pub fn len(&self) -> usize {
        self.extent.len
    }

    pub fn is_empty(&self) -> bool {
        self.extent.len == 0
    }

    pub fn buffer(&self) -> &BufferView {
        &self.view
    }

    pub fn is_queued(&self) -> bool {
        self.flags.load(Ordering::Acquire) & QUEUED != 0
    }

    pub fn is_active(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ACTIVE != 0
    }

    pub fn is_sent(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SENT != 0
    }

    /// Set once an administrative stop asked the backing store to halt this unit.
    pub fn wants_stop(&self) -> bool {
        self.flags.load(Ordering::Acquire) & WANTS_STOP != 0
    }

    pub fn is_complete(&self) -> bool {
        self.flags.load(Ordering::Acquire) & COMPLETE != 0
    }

    pub(crate) fn mark_queued(&self) {
        self.flags.fetch_or(QUEUED, Ordering::AcqRel);
    }

    pub(crate) fn clear_queued(&self) {
        self.flags.fetch_and(!QUEUED, Ordering::AcqRel);
    }

    /// Queued -> active + sent. Called with the run queue locked.
    pub(crate) fn mark_dispatched(&self) {
        self.flags.fetch_and(!QUEUED, Ordering::AcqRel);
        self.flags.fetch_or(ACTIVE | SENT, Ordering::AcqRel);
    }

    pub(crate) fn clear_dispatched(&self) {
        self.flags.fetch_and(!(ACTIVE | SENT), Ordering::AcqRel);
    }

    pub(crate) fn mark_wants_stop(&self) {
        self.flags.fetch_or(WANTS_STOP, Ordering::AcqRel);
    }

    /// Reports the result of this unit to the engine.
    ///
    /// Only the first call counts; later calls are logged and ignored.
    pub fn complete(self: &Arc<Self>, status: UnitStatus) {
        let prev = self.flags.fetch_or(COMPLETE, Ordering::AcqRel);
        if prev & COMPLETE != 0 {
            warn!(cmd = %self.command_id, unit = self.index, "unit completed twice; ignoring");
            return;
        }
        self.flags.fetch_and(!(ACTIVE | QUEUED), Ordering::AcqRel);
        self.done.notify_waiters();
        trace!(cmd = %self.command_id, unit = self.index, ?status, "unit complete");

        match self.command() {
            Some(command) => command.device().post(Work::UnitDone {
                unit: Arc::clone(self),
                status,
            }),
            None => warn!(cmd = %self.command_id, "unit completed after its command was released"),
        }
    }

    /// Waits until [`Unit::complete`] has been called.
    pub async fn wait_complete(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("cmd", &self.command_id)
            .field("index", &self.index)
            .field("direction", &self.direction)
            .field("extent", &self.extent)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}
