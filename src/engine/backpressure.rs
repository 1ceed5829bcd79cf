//! Deliveries the front end could not take yet.
//!
//! A busy front end never blocks a worker. The command is parked on its device's
//! retry list and a pass over that list is scheduled on the runtime; the pass
//! itself runs on the worker pool like any other completion work.
//!
//! Entries pushed out by the cap are not dropped. Their outcome becomes a
//! communication failure and they move to a separate list that every pass
//! delivers first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::command::Command;
use super::completion::{self, Delivery};
use super::device::Device;
use super::worker::Work;
use crate::error::EngineError;

#[derive(Default)]
struct RetryState {
    pending: VecDeque<Arc<Command>>,
    /// Evicted by the cap; delivered with a failure outcome.
    failed: VecDeque<Arc<Command>>,
    /// A pass is scheduled or running.
    scheduled: bool,
}

pub(crate) struct RetryQueue {
    state: Mutex<RetryState>,
    interval: Duration,
    cap: Option<usize>,
}

impl RetryQueue {
    pub(crate) fn new(interval: Duration, cap: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RetryState::default()),
            interval,
            cap,
        }
    }

    /// Deliveries still owed to the front end, failed ones included.
    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.failed.len()
    }

    /// Parks a command. Returns the entry evicted by the cap, if any, and whether
    /// the caller has to schedule a pass. The evicted entry now carries a
    /// communication failure and stays owed to the front end.
    fn push(&self, command: Arc<Command>) -> (Option<Arc<Command>>, bool) {
        let mut state = self.state.lock();
        state.pending.push_back(command);
        let evicted = match self.cap {
            Some(cap) if state.pending.len() > cap => state.pending.pop_front(),
            _ => None,
        };
        if let Some(oldest) = &evicted {
            // Rewritten before a pass can see it on the failed list.
            oldest.override_outcome(EngineError::communication_failure(
                "front end did not accept the result in time",
            ));
            state.failed.push_back(Arc::clone(oldest));
        }
        let schedule = !state.scheduled;
        state.scheduled = true;
        (evicted, schedule)
    }

    /// Failed entries first, then the rest, each in arrival order.
    fn take(&self) -> (Vec<Arc<Command>>, Vec<Arc<Command>>) {
        let mut state = self.state.lock();
        let failed = state.failed.drain(..).collect();
        let pending = state.pending.drain(..).collect();
        (failed, pending)
    }

    /// Puts back what is still busy, ahead of anything parked during the pass.
    /// Returns whether another pass is needed.
    fn finish_pass(&self, failed: Vec<Arc<Command>>, busy: Vec<Arc<Command>>) -> bool {
        let mut state = self.state.lock();
        for command in failed.into_iter().rev() {
            state.failed.push_front(command);
        }
        for command in busy.into_iter().rev() {
            state.pending.push_front(command);
        }
        state.scheduled = !state.pending.is_empty() || !state.failed.is_empty();
        state.scheduled
    }
}

/// Parks a command whose delivery came back busy.
pub(crate) fn defer(device: &Arc<Device>, command: Arc<Command>) {
    debug!(cmd = %command.id(), lun = device.lun(), "front end busy, deferring delivery");
    let (evicted, schedule) = device.retry_queue().push(command);
    if let Some(oldest) = evicted {
        warn!(
            cmd = %oldest.id(),
            lun = device.lun(),
            "too many pending deliveries, failing the oldest"
        );
        device.stats().record_failed_delivery();
    }
    if schedule {
        schedule_pass(device);
    }
}

fn schedule_pass(device: &Arc<Device>) {
    let interval = device.retry_queue().interval;
    let target = Arc::clone(device);
    device.runtime().spawn(async move {
        tokio::time::sleep(interval).await;
        let work = Work::Retry(Arc::clone(&target));
        target.post(work);
    });
}

/// Re-attempts every parked delivery in order.
pub(crate) fn retry_pass(device: &Arc<Device>) {
    let (failed, pending) = device.retry_queue().take();
    let attempted = failed.len() + pending.len();
    let still_busy = |commands: Vec<Arc<Command>>| -> Vec<Arc<Command>> {
        commands
            .into_iter()
            .filter(|command| completion::deliver(command) == Delivery::Busy)
            .collect()
    };
    let failed = still_busy(failed);
    let busy = still_busy(pending);
    debug!(
        lun = device.lun(),
        attempted,
        still_busy = failed.len() + busy.len(),
        "delivery retry pass"
    );
    if device.retry_queue().finish_pass(failed, busy) {
        schedule_pass(device);
    }
}
