//! The completion worker pool.
//!
//! Unit completions and delivery retries never run on the thread that reported
//! them; they go through a channel to a fixed set of tasks.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::Command;
use super::device::Device;
use super::unit::{Unit, UnitStatus};
use super::{backpressure, completion};

pub(crate) type WorkSender = mpsc::UnboundedSender<Work>;

pub(crate) enum Work {
    UnitDone { unit: Arc<Unit>, status: UnitStatus },
    /// A command with nothing to execute.
    Finish(Arc<Command>),
    Retry(Arc<Device>),
}

impl Work {
    pub(crate) fn run(self) {
        match self {
            Work::UnitDone { unit, status } => completion::unit_done(&unit, status),
            Work::Finish(command) => completion::finish(&command),
            Work::Retry(device) => backpressure::retry_pass(&device),
        }
    }
}

pub(crate) fn spawn_workers(
    runtime: &Handle,
    count: usize,
    rx: mpsc::UnboundedReceiver<Work>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            runtime.spawn(async move {
                debug!(worker, "completion worker started");
                loop {
                    let work = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            work = rx.recv() => work,
                        }
                    };
                    match work {
                        Some(work) => work.run(),
                        None => break,
                    }
                }
                debug!(worker, "completion worker stopped");
            })
        })
        .collect()
}
