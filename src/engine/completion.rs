//! Completion pipeline: unit results in, one terminal outcome per command out.

use std::sync::Arc;

use tracing::{debug, warn};

use super::backpressure;
use super::command::{Command, Outcome};
use super::frontend::DeliveryError;
use super::unit::{Unit, UnitStatus};
use crate::scsi::Direction;

/// Result of one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Delivered, or given up on for good.
    Done,
    /// The front end is temporarily unable to take it.
    Busy,
}

pub(crate) fn unit_done(unit: &Arc<Unit>, status: UnitStatus) {
    let Some(command) = unit.command() else {
        return;
    };
    match status {
        UnitStatus::Good => command.account_unit(unit),
        UnitStatus::Failed(err) => {
            debug!(cmd = %command.id(), unit = unit.index(), %err, "unit failed");
            command.record_failure(err);
        }
    }
    if command.unit_finished() {
        finish(&command);
    }
}

/// Terminal phase. Safe to call more than once; only the first call does anything.
pub(crate) fn finish(command: &Arc<Command>) {
    let Some(stopped) = command.enter_terminal() else {
        return;
    };
    let device = command.device();
    device.finish_ordering(command);
    let outcome = command.settle(stopped);
    device.stats().record(command, &outcome);
    device.untrack(command);
    debug!(cmd = %command.id(), lun = command.lun(), ?outcome, "command finished");

    if deliver(command) == Delivery::Busy {
        backpressure::defer(device, Arc::clone(command));
    }
    command.mark_finished();
}

/// Calls the front end hook matching the outcome.
pub(crate) fn deliver(command: &Arc<Command>) -> Delivery {
    let session = command.session();
    let frontend = session.frontend();
    let result = match command.outcome() {
        Some(Outcome::TaskManagement(_)) => frontend.deliver_task_management_response(command),
        Some(Outcome::Good { .. })
            if matches!(
                command.direction(),
                Direction::DataIn | Direction::Bidirectional
            ) =>
        {
            frontend.deliver_data(command)
        }
        Some(_) => frontend.deliver_status(command),
        None => {
            warn!(cmd = %command.id(), "delivery attempted before the terminal phase");
            return Delivery::Done;
        }
    };

    match result {
        Ok(()) => {
            if command.mark_delivered() {
                session.release(command);
            }
            Delivery::Done
        }
        // Retried even while the session drains; the drain waits for it.
        Err(DeliveryError::Busy) => Delivery::Busy,
        Err(DeliveryError::Failed(reason)) => {
            warn!(cmd = %command.id(), session = %session.id(), %reason, "delivery failed");
            session.release(command);
            Delivery::Done
        }
    }
}
