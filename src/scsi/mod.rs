//! SCSI protocol and format definitions the execution engine speaks, as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//! - SCSI Architecture Model – 2 (SAM-2) for task attributes and task management functions.
//!
//! Nothing in here knows about queues or backing stores; the engine decodes a CDB with
//! [`command_descriptor::decode`] and reports failures through [`sense::SenseBuffer`].

pub mod command;
pub mod command_descriptor;
pub mod response;
pub mod sense;

pub use command::CommandBlock;
pub use command_descriptor::{CdbKind, DecodedCdb, Direction, OpCode};
pub use response::ScsiStatus;
pub use sense::{AdditionalSense, SenseBuffer, SenseKey};

/// The largest CDB the engine accepts.
pub const MAX_CDB_SIZE: usize = 16;

/// "The task attribute specifies the order in which the task is processed relative
/// to other tasks in the task set."
///
/// SAM-2 7.5.2. ACA is not supported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TaskAttribute {
    /// SIMPLE: may be reordered freely against other simple tasks.
    #[default]
    Simple,
    /// HEAD OF QUEUE: runs before anything already queued.
    HeadOfQueue,
    /// ORDERED: runs only after every older task completed, and blocks
    /// every younger task until it completes.
    Ordered,
}

/// Task management functions, SAM-2 6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskManagementFunction {
    /// Abort the task with the given tag from the same session.
    AbortTask { tag: u64 },
    /// Abort every task from the same session on the LUN.
    AbortTaskSet,
    /// Abort every task from every session on the LUN.
    ClearTaskSet,
    /// Abort everything on the LUN and raise a unit attention on other sessions.
    LogicalUnitReset,
}

/// Task management service responses, SAM-2 6.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskManagementResponse {
    FunctionComplete,
    TaskDoesNotExist,
    FunctionRejected,
}
