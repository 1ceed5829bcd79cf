//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

/// Status byte returned with every completed command, SAM-2 5.3.1 table 22.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    Busy = 0x08,
    ReservationConflict = 0x18,
    TaskSetFull = 0x28,
    TaskAborted = 0x40,
}

pub type ResponseParser = fn(&[u8]) -> color_eyre::Result<Response>;

pub enum Response {
    Inquiry(Inquiry),
    ReadCapacity(ReadCapacity),
    None,
}

pub fn no_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(buf.is_empty(), "expected no data, got {} bytes", buf.len());
    Ok(Response::None)
}

pub fn inquiry_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(
        buf.len() >= STANDARD_INQUIRY_LEN,
        "standard INQUIRY data is at least {STANDARD_INQUIRY_LEN} bytes, got {}",
        buf.len()
    );
    Ok(Response::Inquiry(Inquiry {
        peripheral_info: buf[0],
        vendor: buf[8..16].try_into()?,
        product: buf[16..32].try_into()?,
    }))
}

pub fn read_capacity_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(
        buf.len() == READ_CAPACITY_10_LEN,
        "READ CAPACITY(10) data is {READ_CAPACITY_10_LEN} bytes, got {}",
        buf.len()
    );
    Ok(Response::ReadCapacity(ReadCapacity {
        last_lba: u32::from_be_bytes(buf[0..4].try_into()?),
        block_size: u32::from_be_bytes(buf[4..8].try_into()?),
    }))
}

/// "The standard INQUIRY data shall contain at least 36 bytes"
/// (SPC-2 table 46)
pub const STANDARD_INQUIRY_LEN: usize = 36;

/// SBC-2 table 30
pub const READ_CAPACITY_10_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inquiry {
    /// Contains both the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE (bits 4:0)
    /// fields.
    ///
    /// The PERIPHERAL QUALIFIER field describes the current state
    /// of the device; zero means the device type below is connected.
    /// (see SPC-2 table 47 for exact definitions).
    ///
    /// Every device the engine exports is a direct access device, so the
    /// PERIPHERAL DEVICE TYPE is 0h0 (see table 48)
    pub peripheral_info: u8,
    /// T10 VENDOR IDENTIFICATION, space padded ASCII.
    pub vendor: [u8; 8],
    /// PRODUCT IDENTIFICATION, space padded ASCII.
    pub product: [u8; 16],
}

impl Inquiry {
    /// Standard INQUIRY data for a direct access block device.
    pub fn direct_access(vendor: &str, product: &str) -> Self {
        Self {
            peripheral_info: 0,
            vendor: space_padded(vendor),
            product: space_padded(product),
        }
    }

    pub fn to_bytes(&self) -> [u8; STANDARD_INQUIRY_LEN] {
        let mut out = [0u8; STANDARD_INQUIRY_LEN];
        out[0] = self.peripheral_info;
        // VERSION: SPC-2
        out[2] = 0x04;
        // RESPONSE DATA FORMAT 2, HISUP
        out[3] = 0x12;
        out[4] = (STANDARD_INQUIRY_LEN - 5) as u8;
        // CMDQUE: the engine handles tagged queueing
        out[7] = 0x02;
        out[8..16].copy_from_slice(&self.vendor);
        out[16..32].copy_from_slice(&self.product);
        out[32..36].copy_from_slice(b"0001");
        out
    }
}

/// Parameter data returned by READ CAPACITY(10).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadCapacity {
    /// "The RETURNED LOGICAL BLOCK ADDRESS field ... the LBA of the last logical block".
    /// Saturates at `u32::MAX` for devices too large for the 10-byte form.
    pub last_lba: u32,
    pub block_size: u32,
}

impl ReadCapacity {
    pub fn new(capacity_blocks: u64, block_size: u32) -> Self {
        let last = capacity_blocks.saturating_sub(1);
        Self {
            last_lba: u32::try_from(last).unwrap_or(u32::MAX),
            block_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; READ_CAPACITY_10_LEN] {
        let mut out = [0u8; READ_CAPACITY_10_LEN];
        out[0..4].copy_from_slice(&self.last_lba.to_be_bytes());
        out[4..8].copy_from_slice(&self.block_size.to_be_bytes());
        out
    }
}

fn space_padded<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (dst, src) in out.iter_mut().zip(value.bytes()) {
        *dst = src;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_parses_back() {
        let bytes = Inquiry::direct_access("LUNAGLAS", "RAMDISK").to_bytes();
        let Response::Inquiry(parsed) = inquiry_response(&bytes).unwrap() else {
            panic!("expected inquiry data");
        };
        assert_eq!(parsed.peripheral_info, 0);
        assert_eq!(&parsed.vendor, b"LUNAGLAS");
        assert_eq!(&parsed.product, b"RAMDISK         ");
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let bytes = ReadCapacity::new(2048, 512).to_bytes();
        let Response::ReadCapacity(parsed) = read_capacity_response(&bytes).unwrap() else {
            panic!("expected capacity data");
        };
        assert_eq!(parsed.last_lba, 2047);
        assert_eq!(parsed.block_size, 512);
    }

    #[test]
    fn no_response_rejects_data() {
        assert!(no_response(&[]).is_ok());
        assert!(no_response(&[1]).is_err());
    }
}
