//! Sessions: the per-initiator registry of live commands.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::abort;
use super::command::{Command, CommandId};
use super::frontend::FrontEnd;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::scsi::AdditionalSense;

pub(crate) type SessionTable = Mutex<HashMap<SessionId, Arc<Session>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One front end connection. Owns a reference on every command it submitted until
/// that command was delivered and released.
pub struct Session {
    id: SessionId,
    frontend: Arc<dyn FrontEnd>,
    commands: Mutex<HashMap<CommandId, Arc<Command>>>,
    accepting: AtomicBool,
    draining: AtomicBool,
    drained: Notify,
    unit_attention: Mutex<VecDeque<(u64, AdditionalSense)>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, frontend: Arc<dyn FrontEnd>) -> Arc<Self> {
        Arc::new(Self {
            id,
            frontend,
            commands: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
            unit_attention: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn frontend(&self) -> &Arc<dyn FrontEnd> {
        &self.frontend
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Commands that still hold a reference.
    pub fn live_commands(&self) -> usize {
        self.commands.lock().len()
    }

    pub(crate) fn register(&self, command: &Arc<Command>, hold: bool) -> EngineResult<()> {
        let mut commands = self.commands.lock();
        if !self.is_accepting() {
            return Err(EngineError::with_message(
                ErrorKind::NotReady,
                format!("session {} is draining", self.id),
            ));
        }
        command.init_refs(if hold { 2 } else { 1 });
        commands.insert(command.id(), Arc::clone(command));
        Ok(())
    }

    /// Drops one reference on `command`.
    ///
    /// Front ends call this once for every command submitted with
    /// [`CommandRequest::hold`](crate::CommandRequest::hold), after the result was
    /// delivered. The last reference tears the command down.
    pub fn release(&self, command: &Arc<Command>) {
        match command.put_ref() {
            Some(true) => {}
            Some(false) => return,
            None => {
                warn!(
                    cmd = %command.id(),
                    session = %self.id,
                    "command released more often than referenced"
                );
                return;
            }
        }

        let now_empty = {
            let mut commands = self.commands.lock();
            commands.remove(&command.id());
            commands.is_empty()
        };
        command.release_buffers();
        self.frontend.release_command(command);
        debug!(cmd = %command.id(), session = %self.id, "command released");

        if now_empty && self.is_draining() {
            self.drained.notify_waiters();
        }
    }

    /// Stops accepting commands, stops those still waiting on a backing store and
    /// waits until every command was released.
    ///
    /// Results the front end answers with [`DeliveryError::Busy`](super::DeliveryError::Busy)
    /// keep being retried, so this only returns once the front end took them
    /// and dropped any held references.
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn drain(&self) {
        let snapshot: Vec<_> = {
            let commands = self.commands.lock();
            self.accepting.store(false, Ordering::Release);
            self.draining.store(true, Ordering::Release);
            commands.values().cloned().collect()
        };
        let in_flight: Vec<_> = snapshot
            .into_iter()
            .filter(|cmd| cmd.units_sent() > 0 && !cmd.is_terminal())
            .collect();
        info!(stopping = in_flight.len(), "draining session");
        abort::stop_commands(&in_flight).await;

        loop {
            let notified = self.drained.notified();
            if self.commands.lock().is_empty() {
                break;
            }
            notified.await;
        }
        info!("session drained");
    }

    pub(crate) fn queue_unit_attention(&self, lun: u64, sense: AdditionalSense) {
        debug!(session = %self.id, lun, %sense, "unit attention queued");
        self.unit_attention.lock().push_back((lun, sense));
    }

    /// Consumes the oldest unit attention pending for `lun`.
    pub(crate) fn take_unit_attention(&self, lun: u64) -> Option<AdditionalSense> {
        let mut pending = self.unit_attention.lock();
        let position = pending.iter().position(|(ua_lun, _)| *ua_lun == lun)?;
        pending.remove(position).map(|(_, sense)| sense)
    }

    /// Whether a unit attention is pending for `lun`.
    pub fn has_unit_attention(&self, lun: u64) -> bool {
        self.unit_attention.lock().iter().any(|(ua_lun, _)| *ua_lun == lun)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("live_commands", &self.live_commands())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
