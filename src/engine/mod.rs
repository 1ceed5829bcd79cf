//! The command execution engine.
//!
//! A front end opens a [`Session`] and submits [`CommandRequest`]s. Each command is
//! validated, split into [`Unit`]s no larger than its device's maximum transfer,
//! admitted through the task attribute rules and queued for the device's dispatch
//! loop, which hands units to the [`BackingStore`]. Unit results come back through
//! a worker pool; the last one runs the command's terminal phase and delivers the
//! outcome to the session's [`FrontEnd`].
//!
//! ```text
//!  submit ──> split ──> ordering ──> run queue ──> dispatch ──> BackingStore::execute
//!                          ^                                            │
//!                          │                                     Unit::complete
//!                          │                                            v
//!                          └──── finish <──── unit_done <──── worker pool
//!                                   │
//!                                   v
//!                        FrontEnd::deliver_* ──busy──> retry list
//! ```

mod abort;
mod backpressure;
mod buffer;
mod command;
mod completion;
mod device;
mod frontend;
mod ordering;
mod session;
mod splitter;
mod unit;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use color_eyre::eyre::{WrapErr, ensure, eyre};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use buffer::{BufferView, ScatterList, Segment, ViewEntry};
pub use command::{Command, CommandId, CommandPhase, CommandRequest, Operation, Outcome, Residual};
pub use device::{Device, DeviceStats, StatsSnapshot};
pub use frontend::{AccessCheck, AllowAll, DeliveryError, FrontEnd};
pub use ordering::OrderingSnapshot;
pub use session::{Session, SessionId};
pub use splitter::{TransferLayout, plan_extents};
pub use unit::{Unit, UnitExtent, UnitStatus};

use crate::backstore::BackingStore;
use crate::config::{DeviceConfig, EngineConfig};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::scsi::{TaskAttribute, TaskManagementFunction};
use command::CommandParts;
use session::SessionTable;
use worker::{Work, WorkSender};

struct Shared {
    config: EngineConfig,
    runtime: Handle,
    work: WorkSender,
    workers: Mutex<Vec<JoinHandle<()>>>,
    devices: Mutex<HashMap<u64, Arc<Device>>>,
    sessions: Arc<SessionTable>,
    access: Arc<dyn AccessCheck>,
    next_command: AtomicU64,
    next_session: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Starts the worker pool on the current tokio runtime.
    pub fn start(config: EngineConfig) -> color_eyre::Result<Self> {
        Self::start_with_access(config, Arc::new(AllowAll))
    }

    /// Like [`Engine::start`], with an access check run on every submission.
    #[tracing::instrument(skip(access))]
    pub fn start_with_access(
        config: EngineConfig,
        access: Arc<dyn AccessCheck>,
    ) -> color_eyre::Result<Self> {
        ensure!(config.workers > 0, "the engine needs at least one worker");
        ensure!(config.segment_size > 0, "segment size must be non-zero");
        let runtime = Handle::try_current().wrap_err("the engine runs on a tokio runtime")?;

        let (work, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let workers = worker::spawn_workers(&runtime, config.workers, rx, shutdown.clone());
        info!(workers = config.workers, "engine started");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                work,
                workers: Mutex::new(workers),
                devices: Mutex::new(HashMap::new()),
                sessions: Arc::new(Mutex::new(HashMap::new())),
                access,
                next_command: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Attaches `store` at `lun` and starts its dispatch loop.
    #[tracing::instrument(skip(self, store, config))]
    pub fn attach_device(
        &self,
        lun: u64,
        store: Arc<dyn BackingStore>,
        config: DeviceConfig,
    ) -> color_eyre::Result<Arc<Device>> {
        ensure!(store.block_size() > 0, "backing store reports a zero block size");
        ensure!(
            !self.shared.shutdown.is_cancelled(),
            "engine is shutting down"
        );
        let mut devices = self.shared.devices.lock();
        ensure!(!devices.contains_key(&lun), "lun {lun} is already attached");

        let device = Device::new(
            lun,
            store,
            &config,
            &self.shared.config,
            self.shared.work.clone(),
            self.shared.runtime.clone(),
            Arc::clone(&self.shared.sessions),
            self.shared.shutdown.child_token(),
        );
        device.start_dispatcher();
        info!(
            name = device.name(),
            kind = ?device.kind(),
            block_size = device.block_size(),
            capacity = device.capacity(),
            max_transfer_blocks = device.max_transfer_blocks(),
            "device attached"
        );
        devices.insert(lun, Arc::clone(&device));
        Ok(device)
    }

    /// Resets the LUN, then stops its dispatch loop.
    #[tracing::instrument(skip(self))]
    pub async fn detach_device(&self, lun: u64) -> color_eyre::Result<()> {
        let device = self
            .shared
            .devices
            .lock()
            .remove(&lun)
            .ok_or_else(|| eyre!("no device attached at lun {lun}"))?;
        abort::reset_device(&device, None).await;
        device.stop_dispatcher().await;
        info!("device detached");
        Ok(())
    }

    pub fn device(&self, lun: u64) -> Option<Arc<Device>> {
        self.shared.devices.lock().get(&lun).cloned()
    }

    pub fn open_session(&self, frontend: Arc<dyn FrontEnd>) -> Arc<Session> {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(id, frontend);
        self.shared
            .sessions
            .lock()
            .insert(id, Arc::clone(&session));
        info!(session = %id, "session opened");
        session
    }

    /// Drains the session and forgets it.
    pub async fn close_session(&self, session: &Arc<Session>) {
        session.drain().await;
        self.shared.sessions.lock().remove(&session.id());
        info!(session = %session.id(), "session closed");
    }

    /// Submits a SCSI command.
    ///
    /// An error here is the command's terminal outcome; nothing is delivered to the
    /// front end for it. Otherwise the outcome arrives through the session's
    /// [`FrontEnd`], possibly before this returns.
    pub fn submit(
        &self,
        session: &Arc<Session>,
        request: CommandRequest,
    ) -> EngineResult<Arc<Command>> {
        if !session.is_accepting() {
            return Err(EngineError::with_message(
                ErrorKind::NotReady,
                format!("session {} is draining", session.id()),
            ));
        }
        let device = self
            .device(request.lun)
            .ok_or_else(|| EngineError::lun_not_supported(request.lun))?;
        let cdb = request.cdb.decode()?;

        if cdb.opcode.reports_unit_attention() {
            if let Some(sense) = session.take_unit_attention(device.lun()) {
                debug!(
                    session = %session.id(),
                    lun = device.lun(),
                    %sense,
                    "reporting unit attention"
                );
                return Err(EngineError::unit_attention(sense));
            }
        }
        self.shared.access.check(session, &device, &cdb)?;
        let layout = splitter::validate(&cdb, device.block_size(), device.capacity(), &request)?;

        let CommandRequest {
            tag,
            attribute,
            data,
            bidi_data,
            hold,
            ..
        } = request;
        let data = match data {
            Some(data) => Some(data),
            None if layout.transfer_len > 0 => Some(ScatterList::zeroed(
                layout.transfer_len,
                self.shared.config.segment_size,
            )),
            None => None,
        };

        let command = Command::new(CommandParts {
            id: self.next_command_id(),
            tag,
            attribute,
            operation: Operation::Scsi(cdb),
            layout,
            data,
            bidi_data,
            device: Arc::clone(&device),
            session: Arc::clone(session),
        });
        session.register(&command, hold)?;
        device.track(&command);
        debug!(
            cmd = %command.id(),
            session = %session.id(),
            lun = device.lun(),
            opcode = ?cdb.opcode,
            lba = cdb.lba,
            units = command.units_expected(),
            "submitted"
        );

        if command.units_expected() == 0 {
            device.post(Work::Finish(Arc::clone(&command)));
        } else {
            device.admit(&command);
        }
        Ok(command)
    }

    /// Submits a task management function. It runs as a head of queue command on
    /// `lun` and reports back through
    /// [`FrontEnd::deliver_task_management_response`].
    pub fn submit_task_management(
        &self,
        session: &Arc<Session>,
        lun: u64,
        function: TaskManagementFunction,
    ) -> EngineResult<Arc<Command>> {
        let device = self
            .device(lun)
            .ok_or_else(|| EngineError::lun_not_supported(lun))?;
        let command = Command::new(CommandParts {
            id: self.next_command_id(),
            tag: 0,
            attribute: TaskAttribute::HeadOfQueue,
            operation: Operation::TaskManagement(function),
            layout: TransferLayout::none(),
            data: None,
            bidi_data: None,
            device: Arc::clone(&device),
            session: Arc::clone(session),
        });
        session.register(&command, false)?;
        debug!(
            cmd = %command.id(),
            session = %session.id(),
            lun,
            ?function,
            "task management submitted"
        );
        device.admit(&command);
        Ok(command)
    }

    /// Drains every session, detaches every device and stops the worker pool.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.shared.sessions.lock().values().cloned().collect();
        for session in &sessions {
            self.close_session(session).await;
        }

        let luns: Vec<_> = self.shared.devices.lock().keys().copied().collect();
        for lun in luns {
            if let Err(err) = self.detach_device(lun).await {
                warn!(lun, %err, "detach during shutdown failed");
            }
        }

        self.shared.shutdown.cancel();
        let workers: Vec<_> = self.shared.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(%err, "completion worker panicked");
            }
        }
        info!("engine stopped");
    }

    fn next_command_id(&self) -> CommandId {
        CommandId(self.shared.next_command.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("devices", &self.shared.devices.lock().len())
            .field("sessions", &self.shared.sessions.lock().len())
            .finish()
    }
}
