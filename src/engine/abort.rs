//! Administrative stops and task management functions.
//!
//! Stopping is two-phase. First every target is marked stop-requested, pulled off
//! the delayed list and the run queue, and the backing store is asked to halt
//! whatever it already started. Then the caller waits for every unit and for the
//! terminal phase of every target.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::command::Command;
use super::completion;
use super::device::Device;
use super::session::SessionId;
use super::unit::UnitStatus;
use crate::scsi::{AdditionalSense, TaskManagementFunction, TaskManagementResponse};

/// Stops `commands` and waits until each of them reached its terminal phase.
pub(crate) async fn stop_commands(commands: &[Arc<Command>]) {
    for command in commands {
        if command.is_terminal() {
            continue;
        }
        command.request_stop();
        let device = command.device();
        if device.withdraw(command) {
            debug!(cmd = %command.id(), "stopped while delayed");
            for unit in command.units() {
                unit.complete(UnitStatus::aborted());
            }
            continue;
        }
        for unit in device.dequeue(command.id()) {
            unit.complete(UnitStatus::aborted());
        }
        for unit in command.units() {
            if unit.is_active() && !unit.is_complete() {
                unit.mark_wants_stop();
                device.store().stop(unit);
            }
        }
    }

    for command in commands {
        for unit in command.units() {
            unit.wait_complete().await;
        }
        command.wait_terminal().await;
    }
}

/// Stops everything on the device and raises a unit attention on every session.
#[tracing::instrument(skip(device), fields(lun = device.lun()))]
pub(crate) async fn reset_device(device: &Arc<Device>, initiator: Option<SessionId>) {
    let targets = device.active_commands();
    info!(commands = targets.len(), "logical unit reset");
    stop_commands(&targets).await;
    let sessions: Vec<_> = device.sessions().lock().values().cloned().collect();
    for session in sessions {
        if Some(session.id()) != initiator {
            session.queue_unit_attention(device.lun(), AdditionalSense::POWER_ON_RESET);
        }
    }
}

/// Body of a task management command. Runs on its own task once the ordering
/// engine released the command.
pub(crate) async fn run_task_management(
    device: &Arc<Device>,
    command: &Arc<Command>,
    function: TaskManagementFunction,
) {
    let session = command.session_id();
    info!(cmd = %command.id(), lun = device.lun(), %session, ?function, "task management");

    let response = match function {
        TaskManagementFunction::AbortTask { tag } => match device.find_by_tag(session, tag) {
            Some(target) => {
                stop_commands(&[target]).await;
                TaskManagementResponse::FunctionComplete
            }
            None => TaskManagementResponse::TaskDoesNotExist,
        },
        TaskManagementFunction::AbortTaskSet => {
            let targets: Vec<_> = device
                .active_commands()
                .into_iter()
                .filter(|cmd| cmd.session_id() == session)
                .collect();
            stop_commands(&targets).await;
            TaskManagementResponse::FunctionComplete
        }
        TaskManagementFunction::ClearTaskSet => {
            let targets = device.active_commands();
            let cleared: HashSet<SessionId> = targets
                .iter()
                .map(|cmd| cmd.session_id())
                .filter(|id| *id != session)
                .collect();
            stop_commands(&targets).await;
            let sessions: Vec<_> = device.sessions().lock().values().cloned().collect();
            for other in sessions.iter().filter(|s| cleared.contains(&s.id())) {
                other.queue_unit_attention(
                    device.lun(),
                    AdditionalSense::COMMANDS_CLEARED_BY_ANOTHER_INITIATOR,
                );
            }
            TaskManagementResponse::FunctionComplete
        }
        TaskManagementFunction::LogicalUnitReset => {
            reset_device(device, Some(session)).await;
            TaskManagementResponse::FunctionComplete
        }
    };

    command.set_task_management_response(response);
    completion::finish(command);
}
