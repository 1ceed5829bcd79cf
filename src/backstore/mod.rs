//! Backing stores: whatever actually holds the blocks behind a LUN.
//!
//! The engine resolves a store once, at attach time, and from then on only talks to
//! it through [`BackingStore`].

use std::sync::Arc;

use crate::engine::{Unit, UnitStatus};
use crate::error::{EngineError, EngineResult};
use crate::scsi::response::{Inquiry, ReadCapacity};
use crate::scsi::{AdditionalSense, OpCode, SenseBuffer, SenseKey};

pub mod file;
pub mod ramdisk;

pub use file::FileStore;
pub use ramdisk::RamdiskStore;

/// Largest unit a store receives unless it says otherwise.
pub const DEFAULT_MAX_TRANSFER_BLOCKS: u32 = 128;

/// How a store handles commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackstoreKind {
    /// Block device semantics, data lives in memory or on a block device.
    Block,
    /// Data lives in a regular file.
    File,
    /// CDBs are handed to something else untouched.
    PassThrough,
}

/// A plugin executing units against storage.
///
/// [`BackingStore::execute`] must not block: it either accepts the unit and later
/// calls [`Unit::complete`] exactly once (possibly before returning), or rejects
/// it by returning an error, in which case it never completes it. A store should
/// complete a unit with [`UnitStatus::aborted`] instead of starting it when
/// [`Unit::wants_stop`] is already set.
pub trait BackingStore: Send + Sync + 'static {
    fn kind(&self) -> BackstoreKind;

    /// Logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Capacity in logical blocks.
    fn capacity(&self) -> u64;

    fn max_transfer_blocks(&self) -> u32 {
        DEFAULT_MAX_TRANSFER_BLOCKS
    }

    fn execute(&self, unit: Arc<Unit>) -> EngineResult<()>;

    /// Asks the store to halt a started unit. Advisory: the store still completes
    /// the unit, with [`UnitStatus::aborted`] if it managed to stop it.
    fn stop(&self, _unit: &Arc<Unit>) {}
}

/// Geometry and identity used to answer control commands.
#[derive(Clone, Copy, Debug)]
pub struct Identity {
    pub inquiry: Inquiry,
    pub block_size: u32,
    pub capacity: u64,
}

/// Answers the control commands every block store supports the same way.
///
/// `flush` runs for SYNCHRONIZE CACHE.
pub fn emulate_control(
    unit: &Unit,
    identity: &Identity,
    flush: impl FnOnce() -> EngineResult<()>,
) -> UnitStatus {
    let Some(cdb) = unit.cdb() else {
        return UnitStatus::Failed(EngineError::invalid_field("unit carries no CDB"));
    };
    let result = match cdb.opcode {
        OpCode::TestUnitReady | OpCode::PreventAllowMediumRemoval => Ok(()),
        OpCode::SynchronizeCache => flush(),
        OpCode::Inquiry => {
            unit.buffer().copy_from_slice(&identity.inquiry.to_bytes());
            Ok(())
        }
        OpCode::ReadCapacity => {
            let data = ReadCapacity::new(identity.capacity, identity.block_size);
            unit.buffer().copy_from_slice(&data.to_bytes());
            Ok(())
        }
        OpCode::RequestSense => {
            let sense = SenseBuffer::fixed(SenseKey::NoSense, AdditionalSense::NONE);
            unit.buffer().copy_from_slice(sense.as_slice());
            Ok(())
        }
        OpCode::ReportLuns => {
            let lun = unit.command().map(|cmd| cmd.lun()).unwrap_or_default();
            unit.buffer().copy_from_slice(&report_luns_data(lun));
            Ok(())
        }
        other => Err(EngineError::invalid_opcode(other as u8)),
    };
    match result {
        Ok(()) => UnitStatus::Good,
        Err(err) => UnitStatus::Failed(err),
    }
}

/// REPORT LUNS parameter data listing a single LUN, SPC-2 7.19.
fn report_luns_data(lun: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    // LUN LIST LENGTH: one 8 byte entry
    out[0..4].copy_from_slice(&8u32.to_be_bytes());
    // Peripheral device addressing for LUNs below 256, flat space addressing above.
    let entry: u16 = if lun < 256 {
        lun as u16
    } else {
        0x4000 | (lun as u16 & 0x3fff)
    };
    out[8..10].copy_from_slice(&entry.to_be_bytes());
    out
}
