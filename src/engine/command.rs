//! Commands: one logical operation submitted by a front end.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::buffer::ScatterList;
use super::device::Device;
use super::session::{Session, SessionId};
use super::splitter::{self, TransferLayout};
use super::unit::Unit;
use crate::error::{EngineError, ErrorKind};
use crate::scsi::{
    CommandBlock, DecodedCdb, Direction, ScsiStatus, SenseBuffer, TaskAttribute,
    TaskManagementFunction, TaskManagementResponse,
};

/// Engine-assigned command handle, unique for the lifetime of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a front end submits.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub(crate) lun: u64,
    pub(crate) cdb: CommandBlock,
    pub(crate) attribute: TaskAttribute,
    pub(crate) tag: u64,
    pub(crate) data: Option<ScatterList>,
    pub(crate) bidi_data: Option<ScatterList>,
    pub(crate) expected_length: Option<usize>,
    pub(crate) hold: bool,
}

impl CommandRequest {
    pub fn new(lun: u64, cdb: CommandBlock) -> Self {
        Self {
            lun,
            cdb,
            attribute: TaskAttribute::Simple,
            tag: 0,
            data: None,
            bidi_data: None,
            expected_length: None,
            hold: false,
        }
    }

    pub fn attribute(mut self, attribute: TaskAttribute) -> Self {
        self.attribute = attribute;
        self
    }

    /// Initiator task tag, used by ABORT TASK.
    pub fn tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Data buffer: the Data-Out payload for writes, the Data-In destination for
    /// reads. When absent the engine allocates one.
    pub fn data(mut self, data: ScatterList) -> Self {
        self.data = Some(data);
        self
    }

    /// Makes a write command bidirectional: `data_in` receives the read half.
    pub fn bidirectional(mut self, data_in: ScatterList) -> Self {
        self.bidi_data = Some(data_in);
        self
    }

    /// Transfer length the initiator announced at the transport level. Defaults
    /// to the supplied buffer's length, or the CDB's length without a buffer.
    pub fn expected_length(mut self, len: usize) -> Self {
        self.expected_length = Some(len);
        self
    }

    /// Keeps a front-end reference on the command after delivery; the front end
    /// then calls [`Session::release`] when it is done with it.
    pub fn hold(mut self) -> Self {
        self.hold = true;
        self
    }
}

/// Difference between the announced and the actual transfer length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Residual {
    #[default]
    None,
    /// The initiator expected more bytes than the CDB moves.
    Underflow(usize),
    /// The CDB asked for more bytes than the initiator expected; the transfer was
    /// truncated.
    Overflow(usize),
}

/// Terminal result of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Good { residual: Residual },
    Failed(EngineError),
    Aborted,
    TaskManagement(TaskManagementResponse),
}

impl Outcome {
    pub fn status(&self) -> ScsiStatus {
        match self {
            Outcome::Good { .. } | Outcome::TaskManagement(_) => ScsiStatus::Good,
            Outcome::Failed(err) => err.status(),
            Outcome::Aborted => ScsiStatus::TaskAborted,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Outcome::Good { .. })
    }
}

/// What the command does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Scsi(DecodedCdb),
    TaskManagement(TaskManagementFunction),
}

/// Command lifecycle with respect to administrative stops.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandPhase {
    Active = 0,
    StopRequested = 1,
    /// Terminal, after a stop request.
    Stopped = 2,
    /// Terminal, ran to completion.
    Completed = 3,
}

impl CommandPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CommandPhase::Active,
            1 => CommandPhase::StopRequested,
            2 => CommandPhase::Stopped,
            _ => CommandPhase::Completed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandPhase::Stopped | CommandPhase::Completed)
    }
}

/// Where the ordering engine has put a command.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OrderState {
    New = 0,
    Delayed = 1,
    Dispatched = 2,
    /// Pulled off the delayed list by a stop.
    Withdrawn = 3,
    Done = 4,
}

impl OrderState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => OrderState::New,
            1 => OrderState::Delayed,
            2 => OrderState::Dispatched,
            3 => OrderState::Withdrawn,
            _ => OrderState::Done,
        }
    }
}

pub(crate) struct CommandParts {
    pub id: CommandId,
    pub tag: u64,
    pub attribute: TaskAttribute,
    pub operation: Operation,
    pub layout: TransferLayout,
    pub data: Option<ScatterList>,
    pub bidi_data: Option<ScatterList>,
    pub device: Arc<Device>,
    pub session: Arc<Session>,
}

/// A command owned jointly by the engine and the submitting session.
pub struct Command {
    id: CommandId,
    tag: u64,
    attribute: TaskAttribute,
    operation: Operation,
    layout: TransferLayout,
    device: Arc<Device>,
    session: Arc<Session>,
    buffers: Mutex<(Option<ScatterList>, Option<ScatterList>)>,
    units: Vec<Arc<Unit>>,

    order_id: AtomicU64,
    order_state: AtomicU8,
    units_expected: usize,
    units_outstanding: AtomicUsize,
    units_sent: AtomicUsize,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    phase: AtomicU8,
    terminal: AtomicBool,
    finished: AtomicBool,
    terminal_notify: Notify,
    failure: Mutex<Option<EngineError>>,
    tmr_response: Mutex<Option<TaskManagementResponse>>,
    outcome: Mutex<Option<Outcome>>,
    sense: Mutex<SenseBuffer>,
    delivered: AtomicBool,
    refs: AtomicUsize,
}

impl Command {
    pub(crate) fn new(parts: CommandParts) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let units = splitter::split(
                weak,
                parts.id,
                &parts.operation,
                &parts.layout,
                parts.device.max_transfer_blocks(),
                parts.data.as_ref(),
                parts.bidi_data.as_ref(),
            );
            let expected = units.len();
            Command {
                id: parts.id,
                tag: parts.tag,
                attribute: parts.attribute,
                operation: parts.operation,
                layout: parts.layout,
                device: parts.device,
                session: parts.session,
                buffers: Mutex::new((parts.data, parts.bidi_data)),
                units,
                order_id: AtomicU64::new(0),
                order_state: AtomicU8::new(OrderState::New as u8),
                units_expected: expected,
                units_outstanding: AtomicUsize::new(expected),
                units_sent: AtomicUsize::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                phase: AtomicU8::new(CommandPhase::Active as u8),
                terminal: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                terminal_notify: Notify::new(),
                failure: Mutex::new(None),
                tmr_response: Mutex::new(None),
                outcome: Mutex::new(None),
                sense: Mutex::new(SenseBuffer::empty()),
                delivered: AtomicBool::new(false),
                refs: AtomicUsize::new(0),
            }
        })
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn lun(&self) -> u64 {
        self.device.lun()
    }

    pub fn attribute(&self) -> TaskAttribute {
        self.attribute
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn cdb(&self) -> Option<DecodedCdb> {
        match self.operation {
            Operation::Scsi(cdb) => Some(cdb),
            Operation::TaskManagement(_) => None,
        }
    }

    pub fn task_management(&self) -> Option<TaskManagementFunction> {
        match self.operation {
            Operation::TaskManagement(function) => Some(function),
            Operation::Scsi(_) => None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.layout.direction
    }

    /// Bytes moved per direction once the command succeeds.
    pub fn transfer_length(&self) -> usize {
        self.layout.transfer_len
    }

    pub fn residual(&self) -> Residual {
        self.layout.residual
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Primary data buffer; `None` once the command has been released.
    pub fn data(&self) -> Option<ScatterList> {
        self.buffers.lock().0.clone()
    }

    /// Data-In half of a bidirectional command.
    pub fn bidi_data(&self) -> Option<ScatterList> {
        self.buffers.lock().1.clone()
    }

    /// Data the initiator should receive: the bidirectional read half, or the
    /// primary buffer for reads.
    pub fn read_data(&self) -> Option<Vec<u8>> {
        let buffers = self.buffers.lock();
        match self.layout.direction {
            Direction::Bidirectional => buffers.1.as_ref().map(ScatterList::to_vec),
            Direction::DataIn => buffers
                .0
                .as_ref()
                .map(|sgl| sgl.view(0, self.layout.transfer_len).to_vec()),
            _ => None,
        }
    }

    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    pub fn units_expected(&self) -> usize {
        self.units_expected
    }

    pub fn units_outstanding(&self) -> usize {
        self.units_outstanding.load(Ordering::Acquire)
    }

    pub fn units_sent(&self) -> usize {
        self.units_sent.load(Ordering::Acquire)
    }

    pub fn order_id(&self) -> u64 {
        self.order_id.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> CommandPhase {
        CommandPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_stop_requested(&self) -> bool {
        matches!(self.phase(), CommandPhase::StopRequested | CommandPhase::Stopped)
    }

    /// Whether the terminal phase has run.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().clone()
    }

    pub fn sense(&self) -> SenseBuffer {
        *self.sense.lock()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn bytes_transferred(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Acquire),
            self.bytes_out.load(Ordering::Acquire),
        )
    }

    pub(crate) fn set_order_id(&self, id: u64) {
        self.order_id.store(id, Ordering::Release);
    }

    pub(crate) fn order_state(&self) -> OrderState {
        OrderState::from_u8(self.order_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_order_state(&self, state: OrderState) {
        self.order_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn note_sent(&self) {
        self.units_sent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_unsent(&self) {
        self.units_sent.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn account_unit(&self, unit: &Unit) {
        let len = unit.len() as u64;
        match unit.direction() {
            Direction::DataIn => self.bytes_in.fetch_add(len, Ordering::AcqRel),
            _ => self.bytes_out.fetch_add(len, Ordering::AcqRel),
        };
    }

    /// Decrements the outstanding counter. Returns `true` for the one call that
    /// takes it to zero.
    pub(crate) fn unit_finished(&self) -> bool {
        self.units_outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// First failure wins.
    pub(crate) fn record_failure(&self, err: EngineError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub(crate) fn first_failure(&self) -> Option<EngineError> {
        self.failure.lock().clone()
    }

    pub(crate) fn set_task_management_response(&self, response: TaskManagementResponse) {
        *self.tmr_response.lock() = Some(response);
    }

    /// Active -> stop-requested. Returns `false` if the command was already
    /// stopping or finished.
    pub(crate) fn request_stop(&self) -> bool {
        self.phase
            .compare_exchange(
                CommandPhase::Active as u8,
                CommandPhase::StopRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claims the terminal phase. Only the first caller gets `Some`, carrying
    /// whether the command had been asked to stop.
    pub(crate) fn enter_terminal(&self) -> Option<bool> {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return None;
        }
        let stopped = match self.phase.compare_exchange(
            CommandPhase::Active as u8,
            CommandPhase::Completed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(_) => {
                self.phase
                    .store(CommandPhase::Stopped as u8, Ordering::Release);
                true
            }
        };
        Some(stopped)
    }

    /// Builds and records the outcome. Called once from the terminal phase.
    pub(crate) fn settle(&self, stopped: bool) -> Outcome {
        let outcome = if self.task_management().is_some() {
            let response = *self.tmr_response.lock();
            Outcome::TaskManagement(response.unwrap_or(TaskManagementResponse::FunctionRejected))
        } else if stopped {
            Outcome::Aborted
        } else {
            match self.first_failure() {
                Some(err) if err.kind() == ErrorKind::Aborted => Outcome::Aborted,
                Some(err) => Outcome::Failed(err),
                None => Outcome::Good {
                    residual: self.layout.residual,
                },
            }
        };
        if let Outcome::Failed(err) = &outcome {
            *self.sense.lock() = err.sense();
        }
        *self.outcome.lock() = Some(outcome.clone());
        outcome
    }

    /// Marks the end of the terminal phase, after the first delivery attempt.
    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
        self.terminal_notify.notify_waiters();
    }

    /// Replaces the outcome of a command whose delivery is being abandoned.
    pub(crate) fn override_outcome(&self, err: EngineError) {
        *self.sense.lock() = err.sense();
        *self.outcome.lock() = Some(Outcome::Failed(err));
    }

    /// Waits until the terminal phase has recorded an outcome and tried to deliver it.
    pub async fn wait_terminal(&self) {
        loop {
            let notified = self.terminal_notify.notified();
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn mark_delivered(&self) -> bool {
        !self.delivered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn init_refs(&self, count: usize) {
        self.refs.store(count, Ordering::Release);
    }

    /// Drops one reference. Returns `Some(true)` for the drop that reached zero,
    /// `None` if there was nothing left to drop.
    pub(crate) fn put_ref(&self) -> Option<bool> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .ok()
            .map(|prev| prev == 1)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn release_buffers(&self) {
        let mut buffers = self.buffers.lock();
        buffers.0 = None;
        buffers.1 = None;
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("lun", &self.lun())
            .field("attribute", &self.attribute)
            .field("operation", &self.operation)
            .field("units", &self.units_expected)
            .field("outstanding", &self.units_outstanding())
            .field("phase", &self.phase())
            .finish()
    }
}
