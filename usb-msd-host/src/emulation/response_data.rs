// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Helpers for writing response data of the emulated logical unit.

use std::{
    cmp::min,
    io::{self, Write},
};

pub const VENDOR: &[u8; 8] = b"Generic ";
pub const PRODUCT: &[u8; 16] = b"Flash Disk      ";
pub const REVISION: &[u8; 4] = b"8.07";

/// A wrapper around a `Write` that silently truncates its input after a given
/// number of bytes. This matches the semantics of SCSI's ALLOCATION LENGTH
/// field; anything beyond the allocation length is silently omitted.
pub struct SilentlyTruncate<W: Write>(W, usize);

impl<W: Write> SilentlyTruncate<W> {
    pub fn new(writer: W, len: usize) -> Self {
        Self(writer, len)
    }
}

impl<W: Write> Write for SilentlyTruncate<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.1 == 0 {
            // once truncating, pretend every write succeeds
            return Ok(buf.len());
        }
        let len = min(buf.len(), self.1);
        let written = self.0.write(&buf[..len])?;
        self.1 -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Write standard INQUIRY data for a removable direct-access device.
pub fn respond_standard_inquiry_data(data_in: &mut impl Write) -> io::Result<()> {
    data_in.write_all(&[
        0,           // peripheral qualifier 0, direct access block device
        0b1000_0000, // removable medium
        0x4,         // version: SPC-2
        0x2,         // response data format 2
        31,          // additional length
        0,
        0,
        0,
    ])?;
    data_in.write_all(VENDOR)?;
    data_in.write_all(PRODUCT)?;
    data_in.write_all(REVISION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::InquiryData;

    #[test]
    fn test_truncate() {
        let mut out = Vec::new();
        let mut w = SilentlyTruncate::new(&mut out, 5);
        w.write_all(b"abc").unwrap();
        w.write_all(b"defgh").unwrap();
        w.write_all(b"ijk").unwrap();
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn test_inquiry_data() {
        let mut out = Vec::new();
        respond_standard_inquiry_data(&mut out).unwrap();
        assert_eq!(out.len(), InquiryData::LEN);
        assert_eq!(usize::from(out[4]) + 5, out.len());

        let data = InquiryData::parse(&out).unwrap();
        assert!(data.removable);
        assert_eq!(data.to_string(), "Generic Flash Disk 8.07");
    }
}
