//! Task attribute handling, SAM-2 8.6.
//!
//! SIMPLE tasks run concurrently with each other. An ORDERED task waits until every
//! older task finished and holds back every younger one until it finished itself.
//! HEAD OF QUEUE tasks skip the whole thing.

use std::collections::VecDeque;
use std::sync::Arc;

use super::command::{Command, CommandId, OrderState};
use crate::scsi::TaskAttribute;

/// What [`OrderingState::admit`] decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Dispatch,
    Delayed,
}

/// Point in time copy of a device's ordering counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderingSnapshot {
    pub simple_outstanding: usize,
    pub ordered_outstanding: usize,
    pub delayed: usize,
    /// Commands that left the ordering engine since the device was attached.
    pub cursor: u64,
}

#[derive(Default)]
pub(crate) struct OrderingState {
    simple_outstanding: usize,
    ordered_outstanding: usize,
    delayed: VecDeque<Arc<Command>>,
    next_order_id: u64,
    cursor: u64,
}

impl OrderingState {
    fn quiescent(&self) -> bool {
        self.simple_outstanding == 0 && self.ordered_outstanding == 0
    }

    fn dispatch(&mut self, command: &Arc<Command>) {
        match command.attribute() {
            TaskAttribute::Simple => self.simple_outstanding += 1,
            TaskAttribute::Ordered => self.ordered_outstanding += 1,
            TaskAttribute::HeadOfQueue => {}
        }
        command.set_order_state(OrderState::Dispatched);
    }

    pub(crate) fn admit(&mut self, command: &Arc<Command>) -> Admission {
        command.set_order_id(self.next_order_id);
        self.next_order_id += 1;

        let runnable = match command.attribute() {
            TaskAttribute::HeadOfQueue => true,
            TaskAttribute::Simple => self.ordered_outstanding == 0 && self.delayed.is_empty(),
            TaskAttribute::Ordered => self.quiescent() && self.delayed.is_empty(),
        };
        if runnable {
            self.dispatch(command);
            Admission::Dispatch
        } else {
            command.set_order_state(OrderState::Delayed);
            self.delayed.push_back(Arc::clone(command));
            Admission::Delayed
        }
    }

    /// Accounts for a command leaving the engine and returns the delayed commands
    /// that may now run, oldest first.
    pub(crate) fn complete(&mut self, command: &Command) -> Vec<Arc<Command>> {
        if command.order_state() == OrderState::Dispatched {
            match command.attribute() {
                TaskAttribute::Simple => self.simple_outstanding -= 1,
                TaskAttribute::Ordered => self.ordered_outstanding -= 1,
                TaskAttribute::HeadOfQueue => {}
            }
            self.cursor += 1;
        }
        command.set_order_state(OrderState::Done);
        self.replay()
    }

    /// Releases delayed commands from the front until an ordered one is dispatched
    /// or something has to keep waiting.
    fn replay(&mut self) -> Vec<Arc<Command>> {
        let mut released = Vec::new();
        while let Some(next) = self.delayed.front() {
            let ordered = next.attribute() == TaskAttribute::Ordered;
            let runnable = if ordered {
                self.quiescent()
            } else {
                self.ordered_outstanding == 0
            };
            if !runnable {
                break;
            }
            let Some(next) = self.delayed.pop_front() else {
                break;
            };
            self.dispatch(&next);
            released.push(next);
            if ordered {
                break;
            }
        }
        released
    }

    /// Pulls a command off the delayed list. Returns `None` if it is not there.
    pub(crate) fn withdraw(&mut self, id: CommandId) -> Option<Arc<Command>> {
        let position = self.delayed.iter().position(|cmd| cmd.id() == id)?;
        let command = self.delayed.remove(position)?;
        command.set_order_state(OrderState::Withdrawn);
        Some(command)
    }

    pub(crate) fn snapshot(&self) -> OrderingSnapshot {
        OrderingSnapshot {
            simple_outstanding: self.simple_outstanding,
            ordered_outstanding: self.ordered_outstanding,
            delayed: self.delayed.len(),
            cursor: self.cursor,
        }
    }
}
