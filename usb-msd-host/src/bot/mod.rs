// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Bulk-Only Transport framing: the Command Block Wrapper sent ahead of every
//! SCSI command and the Command Status Wrapper that concludes it.

pub mod session;
pub mod stall;

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error as ThisError;

use crate::{scsi, Error, Result, Violation};

pub const CBW_SIGNATURE: u32 = 0x4342_5355; // "USBC"
pub const CSW_SIGNATURE: u32 = 0x5342_5355; // "USBS"
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;
pub const CB_MAX_LEN: usize = 16;

pub const BLOCK_SIZE: usize = 512;
pub const INQUIRY_LEN: usize = 0x24;

/// Class-specific requests of the bulk-only transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ClassRequest {
    GetMaxLun = 0xfe,
    MassStorageReset = 0xff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    const FLAG_IN: u8 = 0x80;

    pub const fn flags(self) -> u8 {
        match self {
            Direction::Out => 0,
            Direction::In => Self::FLAG_IN,
        }
    }

    pub const fn from_flags(flags: u8) -> Self {
        if flags & Self::FLAG_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The SCSI commands the session issues, all addressed to LUN 0 and moving at
/// most one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Inquiry,
    Read10 { lba: u32 },
    Write10 { lba: u32 },
}

impl Command {
    pub const fn data_transfer_length(self) -> u32 {
        match self {
            Command::Inquiry => INQUIRY_LEN as u32,
            Command::Read10 { .. } | Command::Write10 { .. } => BLOCK_SIZE as u32,
        }
    }

    pub const fn direction(self) -> Direction {
        match self {
            Command::Inquiry | Command::Read10 { .. } => Direction::In,
            Command::Write10 { .. } => Direction::Out,
        }
    }
}

/// Source of CBW tags. Tags start at 1 and advance by one per command,
/// whatever the outcome of the command.
///
/// Tags only increase for the first 2^32 - 1 commands of a session. The
/// counter then wraps to 0; the device only compares a CSW tag with the CBW
/// it answers, so a wrapped tag is still unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagCounter(u32);

impl TagCounter {
    pub const fn new() -> Self {
        Self(1)
    }

    /// The tag the next command will carry.
    pub const fn peek(&self) -> u32 {
        self.0
    }

    pub fn next_tag(&mut self) -> u32 {
        let tag = self.0;
        self.0 = self.0.wrapping_add(1);
        tag
    }
}

impl Default for TagCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum CbwParseError {
    #[error("CBW has {0} bytes instead of 31")]
    Length(usize),
    #[error("bad CBW signature {0:#010x}")]
    Signature(u32),
    #[error("invalid command block length {0}")]
    CommandLength(u8),
}

/// Command Block Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub direction: Direction,
    pub lun: u8,
    cb_length: u8,
    cb: [u8; CB_MAX_LEN],
}

impl Cbw {
    /// Wrap a raw command block of 1 to 16 bytes.
    pub fn new(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        command: &[u8],
    ) -> std::result::Result<Self, CbwParseError> {
        if command.is_empty() || command.len() > CB_MAX_LEN {
            return Err(CbwParseError::CommandLength(
                u8::try_from(command.len()).unwrap_or(u8::MAX),
            ));
        }
        Ok(Self::with_block(tag, data_transfer_length, direction, lun, command))
    }

    /// `command` is cut to 16 bytes.
    fn with_block(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        command: &[u8],
    ) -> Self {
        let mut cb = [0; CB_MAX_LEN];
        let cb_length = command.len().min(CB_MAX_LEN);
        cb[..cb_length].copy_from_slice(&command[..cb_length]);

        Self {
            tag,
            data_transfer_length,
            direction,
            lun: lun & 0x0f,
            cb_length: cb_length as u8,
            cb,
        }
    }

    /// Build the CBW for `command` on LUN 0.
    pub fn for_command(command: Command, tag: u32) -> Self {
        let length = command.data_transfer_length();
        let direction = command.direction();
        match command {
            Command::Inquiry => {
                Self::with_block(tag, length, direction, 0, &scsi::inquiry(INQUIRY_LEN as u8))
            }
            Command::Read10 { lba } => Self::with_block(tag, length, direction, 0, &scsi::read_10(lba)),
            Command::Write10 { lba } => Self::with_block(tag, length, direction, 0, &scsi::write_10(lba)),
        }
    }

    pub fn command_block(&self) -> &[u8] {
        &self.cb[..usize::from(self.cb_length)]
    }

    pub fn opcode(&self) -> u8 {
        self.cb[0]
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut raw = [0; CBW_LEN];
        raw[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        raw[12] = self.direction.flags();
        raw[13] = self.lun;
        raw[14] = self.cb_length;
        raw[15..].copy_from_slice(&self.cb);
        raw
    }

    pub fn parse(raw: &[u8]) -> std::result::Result<Self, CbwParseError> {
        let raw: &[u8; CBW_LEN] = raw
            .try_into()
            .map_err(|_| CbwParseError::Length(raw.len()))?;

        let signature = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if signature != CBW_SIGNATURE {
            return Err(CbwParseError::Signature(signature));
        }

        let cb_length = raw[14] & 0x1f;
        if cb_length == 0 || usize::from(cb_length) > CB_MAX_LEN {
            return Err(CbwParseError::CommandLength(cb_length));
        }

        let mut cb = [0; CB_MAX_LEN];
        cb.copy_from_slice(&raw[15..]);

        Ok(Self {
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data_transfer_length: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            direction: Direction::from_flags(raw[12]),
            lun: raw[13] & 0x0f,
            cb_length,
            cb,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// Command Status Wrapper, as received. The signature is kept so that a
/// corrupted wrapper can be reported as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl Csw {
    pub fn new(tag: u32, residue: u32, status: CswStatus) -> Self {
        Self {
            signature: CSW_SIGNATURE,
            tag,
            residue,
            status: status.into(),
        }
    }

    pub fn from_bytes(raw: &[u8; CSW_LEN]) -> Self {
        Self {
            signature: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            residue: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            status: raw[12],
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut raw = [0; CSW_LEN];
        raw[0..4].copy_from_slice(&self.signature.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.residue.to_le_bytes());
        raw[12] = self.status;
        raw
    }

    /// Check this CSW against the CBW it was read for and turn its status into
    /// a transaction result.
    pub fn check(&self, cbw: &Cbw) -> Result<()> {
        if self.signature != CSW_SIGNATURE {
            return Err(Error::ProtocolViolation(Violation::BadSignature(
                self.signature,
            )));
        }
        if self.tag != cbw.tag {
            return Err(Error::ProtocolViolation(Violation::TagMismatch {
                expected: cbw.tag,
                actual: self.tag,
            }));
        }

        match CswStatus::try_from(self.status) {
            Ok(CswStatus::Passed) => Ok(()),
            Ok(CswStatus::Failed) => Err(Error::CommandFailed {
                residue: self.residue,
            }),
            Ok(CswStatus::PhaseError) => Err(Error::PhaseError),
            Err(_) => Err(Error::ProtocolViolation(Violation::ReservedStatus(
                self.status,
            ))),
        }
    }
}

impl fmt::Display for Csw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CSW signature {:#010x} tag {:#x} residue {} status {:#04x}",
            self.signature, self.tag, self.residue, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_tag_counter() {
        let mut tags = TagCounter::new();
        assert_eq!(tags.peek(), 1);
        assert_eq!(tags.next_tag(), 1);
        assert_eq!(tags.next_tag(), 2);
        assert_eq!(tags.peek(), 3);
    }

    #[test]
    fn test_tag_counter_wraps() {
        let mut tags = TagCounter(u32::MAX - 1);
        assert_eq!(tags.next_tag(), u32::MAX - 1);
        assert_eq!(tags.next_tag(), u32::MAX);
        assert_eq!(tags.next_tag(), 0);
        assert_eq!(tags.next_tag(), 1);
    }

    #[test]
    fn test_cbw_new() {
        let cbw = Cbw::new(9, 0, Direction::Out, 0x13, &[scsi::TEST_UNIT_READY; 6]).unwrap();
        assert_eq!(cbw.command_block(), &[0; 6]);
        assert_eq!(cbw.lun, 3);

        assert_eq!(
            Cbw::new(9, 0, Direction::Out, 0, &[]),
            Err(CbwParseError::CommandLength(0))
        );
        assert_eq!(
            Cbw::new(9, 0, Direction::Out, 0, &[0; 17]),
            Err(CbwParseError::CommandLength(17))
        );
        assert_eq!(
            Cbw::new(9, 0, Direction::Out, 0, &[0; 300]),
            Err(CbwParseError::CommandLength(u8::MAX))
        );
    }

    #[test]
    fn test_inquiry_cbw() {
        let cbw = Cbw::for_command(Command::Inquiry, 7);
        assert_eq!(
            cbw.to_bytes(),
            [
                0x55, 0x53, 0x42, 0x43, // signature
                7, 0, 0, 0, // tag
                0x24, 0, 0, 0, // transfer length
                0x80, // device to host
                0,    // LUN
                6,    // CB length
                0x12, 0, 0, 0, 0x24, 0, // INQUIRY
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn test_read_write_cbw() {
        let cbw = Cbw::for_command(Command::Read10 { lba: 0x0102_0304 }, 0x1234_5678);
        let raw = cbw.to_bytes();
        assert_eq!(&raw[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&raw[8..12], &[0x00, 0x02, 0, 0]);
        assert_eq!(raw[12], 0x80);
        assert_eq!(raw[14], 10);
        assert_eq!(
            &raw[15..25],
            &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0, 1, 0]
        );
        assert_eq!(&raw[25..], &[0; 6]);

        let cbw = Cbw::for_command(Command::Write10 { lba: 5 }, 2);
        let raw = cbw.to_bytes();
        assert_eq!(raw[12], 0x00);
        assert_eq!(cbw.direction, Direction::Out);
        assert_eq!(cbw.opcode(), 0x2a);
        assert_eq!(cbw.command_block(), &[0x2a, 0, 0, 0, 0, 5, 0, 0, 1, 0]);
    }

    #[test]
    fn test_cbw_parse() {
        let cbw = Cbw::for_command(Command::Write10 { lba: 9 }, 42);
        assert_eq!(Cbw::parse(&cbw.to_bytes()), Ok(cbw));

        assert_matches!(Cbw::parse(&[0; 30]), Err(CbwParseError::Length(30)));

        let mut raw = cbw.to_bytes();
        raw[0] = 0;
        assert_matches!(Cbw::parse(&raw), Err(CbwParseError::Signature(_)));

        let mut raw = cbw.to_bytes();
        raw[14] = 0;
        assert_matches!(Cbw::parse(&raw), Err(CbwParseError::CommandLength(0)));
        raw[14] = 17;
        assert_matches!(Cbw::parse(&raw), Err(CbwParseError::CommandLength(17)));
    }

    #[test]
    fn test_csw_check() {
        let cbw = Cbw::for_command(Command::Inquiry, 3);

        assert_eq!(Csw::new(3, 0, CswStatus::Passed).check(&cbw), Ok(()));
        assert_eq!(
            Csw::new(3, 512, CswStatus::Failed).check(&cbw),
            Err(Error::CommandFailed { residue: 512 })
        );
        assert_eq!(
            Csw::new(3, 0, CswStatus::PhaseError).check(&cbw),
            Err(Error::PhaseError)
        );
        assert_eq!(
            Csw::new(4, 0, CswStatus::Passed).check(&cbw),
            Err(Error::ProtocolViolation(Violation::TagMismatch {
                expected: 3,
                actual: 4
            }))
        );

        let mut csw = Csw::new(3, 0, CswStatus::Passed);
        csw.signature = CBW_SIGNATURE;
        assert_eq!(
            csw.check(&cbw),
            Err(Error::ProtocolViolation(Violation::BadSignature(
                CBW_SIGNATURE
            )))
        );

        let mut csw = Csw::new(3, 0, CswStatus::Passed);
        csw.status = 3;
        assert_eq!(
            csw.check(&cbw),
            Err(Error::ProtocolViolation(Violation::ReservedStatus(3)))
        );
    }

    #[test]
    fn test_csw_never_passes_when_corrupted() {
        let cbw = Cbw::for_command(Command::Read10 { lba: 0 }, 0x0a0b_0c0d);
        let good = Csw::new(cbw.tag, 0, CswStatus::Passed).to_bytes();

        // Flip every bit of the signature and tag fields in turn.
        for byte in 0..8 {
            for bit in 0..8 {
                let mut raw = good;
                raw[byte] ^= 1 << bit;
                assert_matches!(
                    Csw::from_bytes(&raw).check(&cbw),
                    Err(Error::ProtocolViolation(_))
                );
            }
        }
    }

    #[test]
    fn test_csw_display() {
        let csw = Csw::from_bytes(&[0x55, 0x53, 0x42, 0x53, 2, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            csw.to_string(),
            "CSW signature 0x53425355 tag 0x2 residue 0 status 0x01"
        );
    }
}
