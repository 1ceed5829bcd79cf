//! What the engine calls back into.

use std::fmt;
use std::sync::Arc;

use super::command::Command;
use super::device::Device;
use super::session::Session;
use crate::error::EngineResult;
use crate::scsi::DecodedCdb;

/// Why a delivery did not go through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// Try again later. The engine retries until it succeeds.
    Busy,
    /// Never going to work; the result is dropped.
    Failed(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Busy => write!(f, "front end busy"),
            DeliveryError::Failed(reason) => write!(f, "delivery failed: {reason}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// A transport the engine reports results to.
///
/// Hooks are called from the engine's worker tasks and must not block. Each
/// terminal outcome is passed to exactly one of the `deliver_*` hooks until one
/// of them returns something other than [`DeliveryError::Busy`].
pub trait FrontEnd: Send + Sync + 'static {
    /// A successful read or bidirectional command; data is in
    /// [`Command::read_data`].
    fn deliver_data(&self, command: &Arc<Command>) -> Result<(), DeliveryError>;

    /// Everything else: writes, control commands without data, and failures.
    /// Status and sense are in [`Command::outcome`] and [`Command::sense`].
    fn deliver_status(&self, command: &Arc<Command>) -> Result<(), DeliveryError>;

    fn deliver_task_management_response(
        &self,
        command: &Arc<Command>,
    ) -> Result<(), DeliveryError>;

    /// Called once when the last reference on a command is dropped.
    fn release_command(&self, _command: &Arc<Command>) {}
}

/// Access state check run on every command before it is split, for reservations
/// and ALUA.
pub trait AccessCheck: Send + Sync + 'static {
    fn check(&self, session: &Session, device: &Device, cdb: &DecodedCdb) -> EngineResult<()>;
}

/// Lets everything through.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn check(&self, _session: &Session, _device: &Device, _cdb: &DecodedCdb) -> EngineResult<()> {
        Ok(())
    }
}
