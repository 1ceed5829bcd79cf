//! Fixed format sense data, as described in SPC-2 7.20.2.
//!
//! Consumers that expect sense data read fixed offsets out of the buffer, so the layout
//! here is bit-exact with the conventional format:
//!
//! | byte | field                                   |
//! |------|-----------------------------------------|
//! | 0    | `VALID` (bit 7) and `RESPONSE CODE`     |
//! | 2    | `SENSE KEY` (bits 3:0)                  |
//! | 7    | `ADDITIONAL SENSE LENGTH`               |
//! | 12   | `ADDITIONAL SENSE CODE` (ASC)           |
//! | 13   | `ADDITIONAL SENSE CODE QUALIFIER` (ASCQ)|

use std::fmt;

/// Capacity of the inline sense buffer carried by every command.
pub const SENSE_BUFFER_SIZE: usize = 96;

/// Length of a fixed format sense record with no sense-key specific extensions.
pub const FIXED_SENSE_LEN: usize = 18;

/// "Current error" fixed format response code.
pub const RESPONSE_CODE_CURRENT_FIXED: u8 = 0x70;

const SENSE_KEY_OFFSET: usize = 2;
const ADDITIONAL_LENGTH_OFFSET: usize = 7;
const ASC_OFFSET: usize = 12;
const ASCQ_OFFSET: usize = 13;

/// SPC-2 table 107.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    AbortedCommand = 0xb,
}

impl SenseKey {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0xb => SenseKey::AbortedCommand,
            _ => return None,
        })
    }
}

/// An ASC/ASCQ pair, SPC-2 table 108.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdditionalSense {
    pub asc: u8,
    pub ascq: u8,
}

impl AdditionalSense {
    pub const NONE: Self = Self::new(0x00, 0x00);
    pub const LOGICAL_UNIT_NOT_READY: Self = Self::new(0x04, 0x00);
    pub const LOGICAL_UNIT_COMMUNICATION_FAILURE: Self = Self::new(0x08, 0x00);
    pub const WRITE_ERROR: Self = Self::new(0x0c, 0x00);
    pub const UNRECOVERED_READ_ERROR: Self = Self::new(0x11, 0x00);
    pub const INVALID_COMMAND_OPERATION_CODE: Self = Self::new(0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Self = Self::new(0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: Self = Self::new(0x24, 0x00);
    pub const LOGICAL_UNIT_NOT_SUPPORTED: Self = Self::new(0x25, 0x00);
    /// "POWER ON, RESET, OR BUS DEVICE RESET OCCURRED"
    pub const POWER_ON_RESET: Self = Self::new(0x29, 0x00);
    pub const COMMANDS_CLEARED_BY_ANOTHER_INITIATOR: Self = Self::new(0x2f, 0x00);

    pub const fn new(asc: u8, ascq: u8) -> Self {
        Self { asc, ascq }
    }
}

impl fmt::Display for AdditionalSense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}h/{:02x}h", self.asc, self.ascq)
    }
}

/// Inline, fixed-capacity sense buffer.
///
/// Never allocates; a command carries one of these for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SenseBuffer {
    bytes: [u8; SENSE_BUFFER_SIZE],
    len: usize,
}

impl SenseBuffer {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; SENSE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Builds a "current error" fixed format record.
    pub fn fixed(key: SenseKey, additional: AdditionalSense) -> Self {
        let mut sense = Self::empty();
        sense.bytes[0] = RESPONSE_CODE_CURRENT_FIXED;
        sense.bytes[SENSE_KEY_OFFSET] = key as u8;
        // Counts the bytes following the field itself.
        sense.bytes[ADDITIONAL_LENGTH_OFFSET] =
            (FIXED_SENSE_LEN - ADDITIONAL_LENGTH_OFFSET - 1) as u8;
        sense.bytes[ASC_OFFSET] = additional.asc;
        sense.bytes[ASCQ_OFFSET] = additional.ascq;
        sense.len = FIXED_SENSE_LEN;
        sense
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn response_code(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.bytes[0] & 0x7f)
    }

    pub fn sense_key(&self) -> Option<SenseKey> {
        if self.is_empty() {
            return None;
        }
        SenseKey::from_bits(self.bytes[SENSE_KEY_OFFSET])
    }

    pub fn additional_sense(&self) -> Option<AdditionalSense> {
        (!self.is_empty())
            .then(|| AdditionalSense::new(self.bytes[ASC_OFFSET], self.bytes[ASCQ_OFFSET]))
    }
}

impl Default for SenseBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SenseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseBuffer")
            .field("key", &self.sense_key())
            .field("additional", &self.additional_sense())
            .finish()
    }
}
