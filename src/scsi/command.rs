//! Builders for SCSI command blocks.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular [`X6CommandDescriptor`], [`X10CommandDescriptor`] and
//! [`X16CommandDescriptor`] structs. Front ends usually receive CDBs off the wire and never
//! need these; tests and the CLI use them to speak to the engine.

use super::MAX_CDB_SIZE;
use super::command_descriptor::*;
use crate::error::EngineResult;

/// A serialized command block ready to be submitted
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: usize,
}

impl CommandBlock {
    /// Wraps raw CDB bytes received from a transport.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_CDB_SIZE {
            return None;
        }
        let mut command = [0u8; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            command,
            len: bytes.len(),
        })
    }

    fn from_descriptor(descriptor: &impl CommandDescriptor) -> Self {
        let bytes = descriptor.as_slice();
        let mut command = [0u8; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Self {
            command,
            len: bytes.len(),
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.command[..self.len]
    }

    /// Returns the CDB zero padded to 16 bytes.
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }

    pub fn decode(&self) -> EngineResult<DecodedCdb> {
        decode(self.as_slice())
    }
}

impl std::fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandBlock({:02x?})", self.as_slice())
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status. If the logical
/// unit is unable to become operational or is in a state such that an applicaton client action
/// (e.g START UNIT command) is required to make the unit ready, the device server shall return
/// CHECK CONDITION status with a sense key of NOT READY."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::TestUnitReady,
        logical_block_address: [0, 0, 0],
        misc_len: 0,
        control: 0,
    })
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client.
/// Options allow the client to request additional information."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::Inquiry,
        logical_block_address: [0, 0, 0],
        // For inquiry, is ALLOCATION LENGTH,
        // "The standard INQUIRY data shall contain at least 36 bytes"
        // (table 46)
        misc_len: 36,
        control: 0,
    })
}

/// "The PREVENT ALLOW MEDIUM REMOVAL" command (see table 77) requests that
/// the target enable or disable the removal of the medium in the logical unit."
///
/// SPC-2 7.12
pub fn prevent_allow_medium_removal() -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::PreventAllowMediumRemoval,
        logical_block_address: [0, 0, 0],
        // See table 78, prohibits all form of medium removal
        misc_len: 0b0000_0011,
        control: 0,
    })
}

/// "The REQUEST SENSE command requests that the device server transfer sense data
/// to the application client."
///
/// SPC-2 7.20
pub fn request_sense(allocation_length: u8) -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::RequestSense,
        logical_block_address: [0, 0, 0],
        misc_len: allocation_length,
        control: 0,
    })
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code: OpCode::ReadCapacity,
        service_action: 0,
        logical_block_address: [0; 4],
        misc_info: 0,
        misc_len: [0; 2],
        control: 0,
    })
}

/// SBC-2 5.1.6
pub fn read10(lba: u32, blocks: u16) -> CommandBlock {
    rw10(OpCode::Read10, lba, blocks)
}

/// SBC-2 5.1.21
pub fn write10(lba: u32, blocks: u16) -> CommandBlock {
    rw10(OpCode::Write10, lba, blocks)
}

/// SBC-2 5.1.8
pub fn read16(lba: u64, blocks: u32) -> CommandBlock {
    rw16(OpCode::Read16, lba, blocks)
}

/// SBC-2 5.1.23
pub fn write16(lba: u64, blocks: u32) -> CommandBlock {
    rw16(OpCode::Write16, lba, blocks)
}

/// "The SYNCHRONIZE CACHE command ensures that logical blocks in the cache memory,
/// within the specified range, have their most recent data value recorded on the medium."
///
/// A zero LBA and block count cover the whole medium. SBC-2 5.1.16
pub fn synchronize_cache() -> CommandBlock {
    rw10(OpCode::SynchronizeCache, 0, 0)
}

/// SPC-2 7.19
pub fn report_luns(allocation_length: u32) -> CommandBlock {
    let mut command = [0u8; MAX_CDB_SIZE];
    command[0] = OpCode::ReportLuns as u8;
    command[6..10].copy_from_slice(&allocation_length.to_be_bytes());
    CommandBlock { command, len: 12 }
}

fn rw10(operation_code: OpCode, lba: u32, blocks: u16) -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code,
        service_action: 0,
        logical_block_address: lba.to_be_bytes(),
        misc_info: 0,
        misc_len: blocks.to_be_bytes(),
        control: 0,
    })
}

fn rw16(operation_code: OpCode, lba: u64, blocks: u32) -> CommandBlock {
    CommandBlock::from_descriptor(&X16CommandDescriptor {
        operation_code,
        misc_info: 0,
        logical_block_address: lba.to_be_bytes(),
        param: blocks.to_be_bytes(),
        _reserved: 0,
        control: 0,
    })
}
