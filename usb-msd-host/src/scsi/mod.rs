// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! SCSI command descriptor blocks issued by the host, and the pieces of SCSI
//! response data it looks at.

pub mod sense;

use std::fmt;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;

/// INQUIRY (6)
pub const fn inquiry(allocation_length: u8) -> [u8; 6] {
    [INQUIRY, 0, 0, 0, allocation_length, 0]
}

/// READ (10) of a single block.
pub const fn read_10(lba: u32) -> [u8; 10] {
    rw_10(READ_10, lba)
}

/// WRITE (10) of a single block.
pub const fn write_10(lba: u32) -> [u8; 10] {
    rw_10(WRITE_10, lba)
}

const fn rw_10(opcode: u8, lba: u32) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    [
        opcode, 0, // flags
        lba[0], lba[1], lba[2], lba[3], // LBA, MSB first
        0,      // group number
        0, 1, // transfer length: one block
        0, // control
    ]
}

/// Identification fields of standard INQUIRY data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral: u8,
    pub removable: bool,
    pub version: u8,
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
}

impl InquiryData {
    pub const LEN: usize = 36;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let data = data.get(..Self::LEN)?;
        let mut vendor = [0; 8];
        let mut product = [0; 16];
        let mut revision = [0; 4];
        vendor.copy_from_slice(&data[8..16]);
        product.copy_from_slice(&data[16..32]);
        revision.copy_from_slice(&data[32..36]);

        Some(Self {
            peripheral: data[0],
            removable: data[1] & 0x80 != 0,
            version: data[2],
            vendor,
            product,
            revision,
        })
    }
}

fn printable(field: &[u8]) -> String {
    field
        .iter()
        .filter(|c| (0x20..=0x7e).contains(*c))
        .map(|&c| char::from(c))
        .collect::<String>()
        .trim_end()
        .to_string()
}

impl fmt::Display for InquiryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            printable(&self.vendor),
            printable(&self.product),
            printable(&self.revision)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lba_byte_order() {
        assert_eq!(
            read_10(0xdead_beef),
            [0x28, 0, 0xde, 0xad, 0xbe, 0xef, 0, 0, 1, 0]
        );
        assert_eq!(write_10(0x1ff), [0x2a, 0, 0, 0, 0x01, 0xff, 0, 0, 1, 0]);
    }

    #[test]
    fn test_inquiry_cdb() {
        assert_eq!(inquiry(0x24), [0x12, 0, 0, 0, 0x24, 0]);
    }

    #[test]
    fn test_inquiry_data() {
        let mut raw = [0u8; 36];
        raw[1] = 0x80;
        raw[2] = 0x04;
        raw[8..16].copy_from_slice(b"Generic ");
        raw[16..32].copy_from_slice(b"Flash Disk      ");
        raw[32..36].copy_from_slice(b"8.07");

        let data = InquiryData::parse(&raw).unwrap();
        assert!(data.removable);
        assert_eq!(data.version, 4);
        assert_eq!(data.to_string(), "Generic Flash Disk 8.07");

        assert_eq!(InquiryData::parse(&raw[..35]), None);
    }
}
