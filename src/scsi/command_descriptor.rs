//! Underlying structures that commands are issued in, and the decoder the engine runs
//! on every CDB a front end hands it.

use super::MAX_CDB_SIZE;
use crate::error::{EngineError, EngineResult};

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SBC-2 5.1.5
    Read6 = 0x08,
    /// SBC-2 5.1.20
    Write6 = 0x0a,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1e,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.21
    Write10 = 0x2a,
    /// SBC-2 5.1.16
    SynchronizeCache = 0x35,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-2 5.1.23
    Write16 = 0x8a,
    /// SPC-2 7.19
    ReportLuns = 0xa0,
}

impl TryFrom<u8> for OpCode {
    type Error = EngineError;

    fn try_from(value: u8) -> EngineResult<Self> {
        Ok(match value {
            0x00 => OpCode::TestUnitReady,
            0x03 => OpCode::RequestSense,
            0x08 => OpCode::Read6,
            0x0a => OpCode::Write6,
            0x12 => OpCode::Inquiry,
            0x1e => OpCode::PreventAllowMediumRemoval,
            0x25 => OpCode::ReadCapacity,
            0x28 => OpCode::Read10,
            0x2a => OpCode::Write10,
            0x35 => OpCode::SynchronizeCache,
            0x88 => OpCode::Read16,
            0x8a => OpCode::Write16,
            0xa0 => OpCode::ReportLuns,
            other => return Err(EngineError::invalid_opcode(other)),
        })
    }
}

impl OpCode {
    /// CDB length implied by the GROUP CODE (top three bits), SPC-2 4.3.4.1.
    pub fn cdb_len(self) -> usize {
        match (self as u8) >> 5 {
            0 => 6,
            1 | 2 => 10,
            4 => 16,
            5 => 12,
            _ => MAX_CDB_SIZE,
        }
    }

    /// Whether pending unit attention conditions are reported for this command.
    ///
    /// SAM-2 5.9.7: INQUIRY, REPORT LUNS and REQUEST SENSE never consume one.
    pub fn reports_unit_attention(self) -> bool {
        !matches!(
            self,
            OpCode::Inquiry | OpCode::ReportLuns | OpCode::RequestSense
        )
    }
}

/// Direction of the data phase, from the initiator's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data-Out: from the initiator to the device
    DataOut,
    /// Data-In: from the device to the initiator
    DataIn,
    /// Both phases; the engine runs the splitter once per direction.
    Bidirectional,
    /// For commands with a data transfer length of zero.
    NonDirectional,
}

/// How the task splitter treats a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdbKind {
    /// Transfers `transfer_length` logical blocks starting at `lba`.
    Media,
    /// Small, fixed-size data phase (if any); never split.
    Control,
}

/// Everything the engine needs out of a CDB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedCdb {
    pub opcode: OpCode,
    pub lba: u64,
    /// Logical blocks for [`CdbKind::Media`], bytes (allocation length) for
    /// [`CdbKind::Control`].
    pub transfer_length: u32,
    pub direction: Direction,
    pub kind: CdbKind,
}

impl DecodedCdb {
    /// Bytes the CDB asks to move, given the device's logical block size.
    pub fn transfer_bytes(&self, block_size: u32) -> u64 {
        match self.kind {
            CdbKind::Media => u64::from(self.transfer_length) * u64::from(block_size),
            CdbKind::Control => u64::from(self.transfer_length),
        }
    }
}

/// Decodes a CDB.
///
/// Fails with INVALID COMMAND OPERATION CODE for anything the engine does not know,
/// and INVALID FIELD IN CDB when the CDB is shorter than its group code requires.
pub fn decode(cdb: &[u8]) -> EngineResult<DecodedCdb> {
    let Some(&first) = cdb.first() else {
        return Err(EngineError::invalid_field("empty CDB"));
    };
    let opcode = OpCode::try_from(first)?;
    if cdb.len() < opcode.cdb_len() || cdb.len() > MAX_CDB_SIZE {
        return Err(EngineError::invalid_field(format!(
            "{opcode:?} needs a {} byte CDB, got {}",
            opcode.cdb_len(),
            cdb.len()
        )));
    }

    let media = |direction, lba: u64, transfer_length: u32| DecodedCdb {
        opcode,
        lba,
        transfer_length,
        direction,
        kind: CdbKind::Media,
    };
    let control = |direction, transfer_length: u32| DecodedCdb {
        opcode,
        lba: 0,
        transfer_length,
        direction: if transfer_length == 0 {
            Direction::NonDirectional
        } else {
            direction
        },
        kind: CdbKind::Control,
    };

    Ok(match opcode {
        OpCode::Read6 | OpCode::Write6 => {
            let desc = X6CommandDescriptor::read_from(opcode, cdb);
            // "A TRANSFER LENGTH field set to zero specifies that 256 logical blocks shall be
            // read" (SBC-2 5.1.5)
            let blocks = match desc.misc_len {
                0 => 256,
                n => u32::from(n),
            };
            let lba = u32::from_be_bytes([
                0,
                desc.logical_block_address[0] & 0x1f,
                desc.logical_block_address[1],
                desc.logical_block_address[2],
            ]);
            media(data_direction(opcode), u64::from(lba), blocks)
        }
        OpCode::Read10 | OpCode::Write10 => {
            let desc = X10CommandDescriptor::read_from(opcode, cdb);
            media(
                data_direction(opcode),
                u64::from(u32::from_be_bytes(desc.logical_block_address)),
                u32::from(u16::from_be_bytes(desc.misc_len)),
            )
        }
        OpCode::Read16 | OpCode::Write16 => {
            let desc = X16CommandDescriptor::read_from(opcode, cdb);
            media(
                data_direction(opcode),
                u64::from_be_bytes(desc.logical_block_address),
                u32::from_be_bytes(desc.param),
            )
        }
        OpCode::SynchronizeCache => {
            let desc = X10CommandDescriptor::read_from(opcode, cdb);
            DecodedCdb {
                opcode,
                lba: u64::from(u32::from_be_bytes(desc.logical_block_address)),
                transfer_length: 0,
                direction: Direction::NonDirectional,
                kind: CdbKind::Control,
            }
        }
        OpCode::TestUnitReady | OpCode::PreventAllowMediumRemoval => {
            control(Direction::NonDirectional, 0)
        }
        OpCode::RequestSense => control(Direction::DataIn, u32::from(cdb[4])),
        OpCode::Inquiry => control(
            Direction::DataIn,
            u32::from(u16::from_be_bytes([cdb[3], cdb[4]])),
        ),
        OpCode::ReadCapacity => control(Direction::DataIn, 8),
        OpCode::ReportLuns => control(
            Direction::DataIn,
            u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]),
        ),
    })
}

fn data_direction(opcode: OpCode) -> Direction {
    match opcode {
        OpCode::Write6 | OpCode::Write10 | OpCode::Write16 => Direction::DataOut,
        _ => Direction::DataIn,
    }
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    ///"The `OPERATION CODE` field contains the code value identifying the operation
    /// being requested by the CDB. SAM-2 defines the general structure of the operation
    /// code value. The `OPERATION CODE` field has a consistently defined meaning across
    /// all commands. This standard specifies the operation code values used by the commands
    /// defined herein."
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The upper 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH` (amount of
    /// data to be transferred, usually in blocks),
    /// `PARAMETER LIST LENGTH` (number of bytes sent from the Data-Out buffer),
    /// or `ALLOCATION LENGTH` (The maximum number of bytes a client has allocated for returned
    /// data).
    ///
    ///More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2. The `CONTROL` field
    /// has a consistently defined meaning across all commands."
    pub control: u8,
}

impl X6CommandDescriptor {
    fn read_from(operation_code: OpCode, cdb: &[u8]) -> Self {
        Self {
            operation_code,
            logical_block_address: [cdb[1], cdb[2], cdb[3]],
            misc_len: cdb[4],
            control: cdb[5],
        }
    }
}

impl CommandDescriptor for X6CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    /// See [`X6CommandDescriptor::operation_code`].
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field
    pub service_action: u8,
    /// Big endian. The use of this field varies from command to command.
    pub logical_block_address: [u8; 4],
    /// "Miscellaneous CDB information", usually the GROUP NUMBER.
    pub misc_info: u8,
    /// Big endian `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    pub misc_len: [u8; 2],
    /// See [`X6CommandDescriptor::control`].
    pub control: u8,
}

impl X10CommandDescriptor {
    fn read_from(operation_code: OpCode, cdb: &[u8]) -> Self {
        Self {
            operation_code,
            service_action: cdb[1],
            logical_block_address: [cdb[2], cdb[3], cdb[4], cdb[5]],
            misc_info: cdb[6],
            misc_len: [cdb[7], cdb[8]],
            control: cdb[9],
        }
    }
}

impl CommandDescriptor for X10CommandDescriptor {}

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// This struct implements the format described in
/// "SCSI Primary Commands - 2 (SPC-2)" 4.3.2 The fixed length CDB formats
/// Table 4 -- Typical CDB for 16-byte commands
#[repr(C, packed)]
pub struct X16CommandDescriptor {
    /// See [`X6CommandDescriptor::operation_code`].
    pub operation_code: OpCode,
    /// "Miscellaneous CDB information" (last 5 bits)
    pub misc_info: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    ///
    /// Big endian.
    pub logical_block_address: [u8; 8],
    /// `TRANSFER_LENGTH` or `PARAMETER_LIST_LENGTH`
    /// or `ALLOCATION LENGTH`, big endian.
    ///
    /// "In commands that use multiple bytes for the `TRANSFER LENGTH` field, a transfer length
    /// of zero indicates that no data transfer shall take place. A value
    /// of one or greater indicates the number of blocks that shall be transferred."
    pub param: [u8; 4],
    pub _reserved: u8,
    /// See [`X6CommandDescriptor::control`].
    pub control: u8,
}

impl X16CommandDescriptor {
    fn read_from(operation_code: OpCode, cdb: &[u8]) -> Self {
        let mut logical_block_address = [0u8; 8];
        logical_block_address.copy_from_slice(&cdb[2..10]);
        Self {
            operation_code,
            misc_info: cdb[1],
            logical_block_address,
            param: [cdb[10], cdb[11], cdb[12], cdb[13]],
            _reserved: cdb[14],
            control: cdb[15],
        }
    }
}

impl CommandDescriptor for X16CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: every implementor is `repr(C, packed)` and made only of bytes,
        // so it has no padding and is exactly `size_of::<Self>()` initialized bytes.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }
}

const _: () = {
    assert!(std::mem::size_of::<X6CommandDescriptor>() == 6);
    assert!(std::mem::size_of::<X10CommandDescriptor>() == 10);
    assert!(std::mem::size_of::<X16CommandDescriptor>() == 16);
};
