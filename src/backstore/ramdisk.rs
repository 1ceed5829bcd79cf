//! A block store held entirely in memory.

use std::sync::Arc;

use color_eyre::eyre::{ensure, eyre};
use parking_lot::RwLock;
use tracing::trace;

use super::{BackingStore, BackstoreKind, DEFAULT_MAX_TRANSFER_BLOCKS, Identity, emulate_control};
use crate::engine::{Unit, UnitStatus};
use crate::error::{EngineError, EngineResult};
use crate::scsi::response::Inquiry;
use crate::scsi::{CdbKind, Direction};

/// Completes every unit before `execute` returns.
pub struct RamdiskStore {
    blocks: RwLock<Vec<u8>>,
    identity: Identity,
    max_transfer_blocks: u32,
}

impl RamdiskStore {
    pub fn new(block_size: u32, capacity: u64) -> color_eyre::Result<Self> {
        ensure!(
            block_size.is_power_of_two() && block_size >= 512,
            "block size {block_size} is not a power of two of at least 512"
        );
        ensure!(capacity > 0, "ramdisk needs at least one block");
        let len = capacity
            .checked_mul(u64::from(block_size))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| eyre!("{capacity} blocks of {block_size} bytes do not fit in memory"))?;
        Ok(Self {
            blocks: RwLock::new(vec![0; len]),
            identity: Identity {
                inquiry: Inquiry::direct_access("LUNAGLAS", "RAMDISK"),
                block_size,
                capacity,
            },
            max_transfer_blocks: DEFAULT_MAX_TRANSFER_BLOCKS,
        })
    }

    pub fn with_max_transfer_blocks(mut self, blocks: u32) -> Self {
        self.max_transfer_blocks = blocks.max(1);
        self
    }

    fn range(&self, unit: &Unit) -> std::ops::Range<usize> {
        let start = unit.lba() as usize * self.identity.block_size as usize;
        start..start + unit.len()
    }

    fn transfer(&self, unit: &Unit) -> EngineResult<()> {
        let range = self.range(unit);
        let out_of_range = || {
            EngineError::lba_out_of_range(
                unit.lba(),
                u64::from(unit.blocks()),
                self.identity.capacity,
            )
        };
        match unit.direction() {
            Direction::DataIn => {
                let blocks = self.blocks.read();
                let src = blocks.get(range).ok_or_else(out_of_range)?;
                unit.buffer().copy_from_slice(src);
            }
            Direction::DataOut => {
                let mut blocks = self.blocks.write();
                let dst = blocks.get_mut(range).ok_or_else(out_of_range)?;
                unit.buffer().copy_to_slice(dst);
            }
            Direction::Bidirectional | Direction::NonDirectional => {}
        }
        Ok(())
    }
}

impl BackingStore for RamdiskStore {
    fn kind(&self) -> BackstoreKind {
        BackstoreKind::Block
    }

    fn block_size(&self) -> u32 {
        self.identity.block_size
    }

    fn capacity(&self) -> u64 {
        self.identity.capacity
    }

    fn max_transfer_blocks(&self) -> u32 {
        self.max_transfer_blocks
    }

    fn execute(&self, unit: Arc<Unit>) -> EngineResult<()> {
        if unit.wants_stop() {
            unit.complete(UnitStatus::aborted());
            return Ok(());
        }
        let Some(cdb) = unit.cdb() else {
            return Err(EngineError::invalid_field("unit carries no CDB"));
        };
        trace!(cmd = %unit.command_id(), lba = unit.lba(), blocks = unit.blocks(), "ramdisk");
        let status = match cdb.kind {
            CdbKind::Media => match self.transfer(&unit) {
                Ok(()) => UnitStatus::Good,
                Err(err) => UnitStatus::Failed(err),
            },
            CdbKind::Control => emulate_control(&unit, &self.identity, || Ok(())),
        };
        unit.complete(status);
        Ok(())
    }
}

impl std::fmt::Debug for RamdiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamdiskStore")
            .field("block_size", &self.identity.block_size)
            .field("capacity", &self.identity.capacity)
            .finish()
    }
}
