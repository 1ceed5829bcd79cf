//! Task splitting: validates a command against its device and cuts the transfer
//! into units no larger than the backing store's maximum transfer size.

use std::sync::{Arc, Weak};

use super::buffer::ScatterList;
use super::command::{Command, CommandId, CommandRequest, Operation, Residual};
use super::unit::{Unit, UnitExtent};
use crate::error::{EngineError, EngineResult};
use crate::scsi::{CdbKind, DecodedCdb, Direction};

/// How a validated command moves data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLayout {
    pub direction: Direction,
    pub kind: CdbKind,
    pub lba: u64,
    /// Logical blocks actually transferred (media commands).
    pub blocks: u64,
    pub block_size: u32,
    /// Bytes moved in each direction.
    pub transfer_len: usize,
    pub residual: Residual,
}

impl TransferLayout {
    /// Layout of a task management request: no data, no units.
    pub(crate) fn none() -> Self {
        Self {
            direction: Direction::NonDirectional,
            kind: CdbKind::Control,
            lba: 0,
            blocks: 0,
            block_size: 0,
            transfer_len: 0,
            residual: Residual::None,
        }
    }
}

/// Checks a request against the device geometry before anything is allocated.
///
/// Capacity violations and misaligned lengths are rejected here, so no unit is
/// ever created for them.
pub(crate) fn validate(
    cdb: &DecodedCdb,
    block_size: u32,
    capacity: u64,
    request: &CommandRequest,
) -> EngineResult<TransferLayout> {
    let cdb_bytes = usize::try_from(cdb.transfer_bytes(block_size))
        .map_err(|_| EngineError::invalid_field("transfer length overflows the address space"))?;
    let supplied = request.data.as_ref().map(ScatterList::len);
    let expected = request.expected_length.or(supplied).unwrap_or(cdb_bytes);

    if cdb.kind == CdbKind::Media {
        let blocks = u64::from(cdb.transfer_length);
        match cdb.lba.checked_add(blocks) {
            Some(end) if end <= capacity => {}
            _ => return Err(EngineError::lba_out_of_range(cdb.lba, blocks, capacity)),
        }
        if expected % block_size as usize != 0 {
            return Err(EngineError::invalid_field(format!(
                "transfer length {expected} is not a multiple of the {block_size} byte block size"
            )));
        }
    }

    let (transfer_len, residual) = if expected > cdb_bytes {
        (cdb_bytes, Residual::Underflow(expected - cdb_bytes))
    } else if expected < cdb_bytes {
        (expected, Residual::Overflow(cdb_bytes - expected))
    } else {
        (cdb_bytes, Residual::None)
    };

    if let Some(len) = supplied {
        if len < transfer_len {
            return Err(EngineError::invalid_field(format!(
                "{len} byte data buffer is shorter than the {transfer_len} byte transfer"
            )));
        }
    }

    let direction = match &request.bidi_data {
        Some(data_in) => {
            if cdb.kind != CdbKind::Media || cdb.direction != Direction::DataOut {
                return Err(EngineError::invalid_field(
                    "only media writes can be made bidirectional",
                ));
            }
            if data_in.len() < transfer_len {
                return Err(EngineError::invalid_field(format!(
                    "{} byte Data-In buffer is shorter than the {transfer_len} byte transfer",
                    data_in.len()
                )));
            }
            Direction::Bidirectional
        }
        None if transfer_len == 0 && cdb.kind == CdbKind::Control => Direction::NonDirectional,
        None => cdb.direction,
    };

    let blocks = match cdb.kind {
        CdbKind::Media => (transfer_len / block_size as usize) as u64,
        CdbKind::Control => 0,
    };

    Ok(TransferLayout {
        direction,
        kind: cdb.kind,
        lba: cdb.lba,
        blocks,
        block_size,
        transfer_len,
        residual,
    })
}

/// Cuts `blocks` blocks starting at `lba` into extents of at most `max_blocks`.
///
/// Produces `ceil(blocks / max_blocks)` extents that exactly cover the range; only
/// the last one may be short.
pub fn plan_extents(lba: u64, blocks: u64, block_size: u32, max_blocks: u32) -> Vec<UnitExtent> {
    let max = u64::from(max_blocks.max(1));
    let block_size = block_size as usize;
    let mut extents = Vec::with_capacity(blocks.div_ceil(max) as usize);
    let mut done = 0u64;
    while done < blocks {
        let n = (blocks - done).min(max);
        extents.push(UnitExtent {
            lba: lba + done,
            blocks: n as u32,
            offset: done as usize * block_size,
            len: n as usize * block_size,
        });
        done += n;
    }
    extents
}

/// Builds the unit list of a command. Runs inside the command's constructor, so
/// the unit set is fixed before the command is visible to anyone.
pub(crate) fn split(
    command: &Weak<Command>,
    id: CommandId,
    operation: &Operation,
    layout: &TransferLayout,
    max_transfer_blocks: u32,
    data: Option<&ScatterList>,
    bidi_data: Option<&ScatterList>,
) -> Vec<Arc<Unit>> {
    let cdb = match operation {
        Operation::Scsi(cdb) => *cdb,
        Operation::TaskManagement(_) => return Vec::new(),
    };

    if layout.kind == CdbKind::Control {
        let view = data
            .map(|sgl| sgl.view(0, layout.transfer_len))
            .unwrap_or_default();
        let extent = UnitExtent {
            lba: cdb.lba,
            blocks: 0,
            offset: 0,
            len: layout.transfer_len,
        };
        return vec![Unit::new(
            command.clone(),
            id,
            0,
            Some(cdb),
            layout.direction,
            extent,
            view,
        )];
    }

    let extents = plan_extents(
        layout.lba,
        layout.blocks,
        layout.block_size,
        max_transfer_blocks,
    );
    let halves: Vec<(Direction, Option<&ScatterList>)> = match layout.direction {
        Direction::Bidirectional => {
            vec![(Direction::DataOut, data), (Direction::DataIn, bidi_data)]
        }
        direction => vec![(direction, data)],
    };

    let mut units = Vec::with_capacity(extents.len() * halves.len());
    for (direction, buffer) in halves {
        for extent in &extents {
            let view = buffer
                .map(|sgl| sgl.view(extent.offset, extent.len))
                .unwrap_or_default();
            units.push(Unit::new(
                command.clone(),
                id,
                units.len(),
                Some(cdb),
                direction,
                *extent,
                view,
            ));
        }
    }
    units
}
