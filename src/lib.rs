//! A SCSI command execution engine.
//!
//! Front ends (transports) submit SCSI commands through an [`Engine`]; the engine
//! splits them into units, applies SAM-2 task attribute rules, runs the units on a
//! [`BackingStore`] and reports one terminal outcome per command back to the front
//! end. See [`engine`] for the pipeline.

pub mod backstore;
pub mod config;
pub mod engine;
pub mod error;
pub mod scsi;

pub use backstore::{BackingStore, BackstoreKind, FileStore, RamdiskStore};
pub use config::{DeviceConfig, EngineConfig};
pub use engine::{
    AccessCheck, AllowAll, Command, CommandId, CommandRequest, DeliveryError, Device, Engine,
    FrontEnd, Outcome, Residual, ScatterList, Session, SessionId, Unit, UnitStatus,
};
pub use error::{EngineError, EngineResult, ErrorKind};
