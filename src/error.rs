//! Errors that end up in front of an initiator.
//!
//! Everything the engine can fail a command with is an [`EngineError`]. The kind decides
//! the SCSI status and sense key; the ASC/ASCQ pair narrows it down.

use std::fmt;

use crate::scsi::{AdditionalSense, ScsiStatus, SenseBuffer, SenseKey};

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad field, unsupported operation, misaligned or oversized transfer.
    InvalidRequest,
    /// LBA/length beyond the end of the device.
    CapacityViolation,
    ReservationConflict,
    /// A pending asynchronous event the initiator must be told about.
    UnitAttention,
    NotReady,
    /// The backing store could not be reached or failed unexpectedly.
    CommunicationFailure,
    /// The backing store reported a media read/write failure.
    Medium,
    /// Administrative stop or task management abort.
    Aborted,
}

impl ErrorKind {
    fn default_sense(self) -> AdditionalSense {
        match self {
            ErrorKind::InvalidRequest => AdditionalSense::INVALID_FIELD_IN_CDB,
            ErrorKind::CapacityViolation => AdditionalSense::LBA_OUT_OF_RANGE,
            ErrorKind::UnitAttention => AdditionalSense::POWER_ON_RESET,
            ErrorKind::NotReady => AdditionalSense::LOGICAL_UNIT_NOT_READY,
            ErrorKind::CommunicationFailure => AdditionalSense::LOGICAL_UNIT_COMMUNICATION_FAILURE,
            ErrorKind::Medium => AdditionalSense::UNRECOVERED_READ_ERROR,
            ErrorKind::ReservationConflict | ErrorKind::Aborted => AdditionalSense::NONE,
        }
    }
}

/// An error surfaced to the front end for a single command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    kind: ErrorKind,
    additional: AdditionalSense,
    message: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            additional: kind.default_sense(),
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(kind)
        }
    }

    /// Overrides the ASC/ASCQ pair picked for the kind.
    pub fn with_sense(mut self, additional: AdditionalSense) -> Self {
        self.additional = additional;
        self
    }

    pub fn invalid_field(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidRequest, message)
    }

    pub fn invalid_opcode(opcode: u8) -> Self {
        Self::with_message(
            ErrorKind::InvalidRequest,
            format!("unsupported operation code {opcode:#04x}"),
        )
        .with_sense(AdditionalSense::INVALID_COMMAND_OPERATION_CODE)
    }

    pub fn lun_not_supported(lun: u64) -> Self {
        Self::with_message(ErrorKind::InvalidRequest, format!("no device attached at lun {lun}"))
            .with_sense(AdditionalSense::LOGICAL_UNIT_NOT_SUPPORTED)
    }

    pub fn lba_out_of_range(lba: u64, blocks: u64, capacity: u64) -> Self {
        Self::with_message(
            ErrorKind::CapacityViolation,
            format!("lba {lba} + {blocks} blocks exceeds capacity of {capacity} blocks"),
        )
    }

    pub fn communication_failure(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::CommunicationFailure, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted)
    }

    pub fn unit_attention(additional: AdditionalSense) -> Self {
        Self::new(ErrorKind::UnitAttention).with_sense(additional)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn additional_sense(&self) -> AdditionalSense {
        self.additional
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The SCSI status an initiator sees for this error.
    pub fn status(&self) -> ScsiStatus {
        match self.kind {
            ErrorKind::ReservationConflict => ScsiStatus::ReservationConflict,
            ErrorKind::Aborted => ScsiStatus::TaskAborted,
            _ => ScsiStatus::CheckCondition,
        }
    }

    pub fn sense_key(&self) -> Option<SenseKey> {
        match self.kind {
            ErrorKind::InvalidRequest | ErrorKind::CapacityViolation => {
                Some(SenseKey::IllegalRequest)
            }
            ErrorKind::UnitAttention => Some(SenseKey::UnitAttention),
            ErrorKind::NotReady | ErrorKind::CommunicationFailure => Some(SenseKey::NotReady),
            ErrorKind::Medium => Some(SenseKey::MediumError),
            ErrorKind::ReservationConflict | ErrorKind::Aborted => None,
        }
    }

    /// Fixed format sense data, or an empty buffer for statuses that carry none.
    pub fn sense(&self) -> SenseBuffer {
        match self.sense_key() {
            Some(key) => SenseBuffer::fixed(key, self.additional),
            None => SenseBuffer::empty(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?} ({}): {}", self.kind, self.additional, msg),
            None => write!(f, "{:?} ({})", self.kind, self.additional),
        }
    }
}

impl std::error::Error for EngineError {}
