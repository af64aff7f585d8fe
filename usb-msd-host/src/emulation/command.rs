// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Parsing of the CDBs the emulated logical unit understands, and the data
//! transfer each one implies. The transport side compares that against what
//! the CBW announced.

use log::warn;

use crate::scsi::{INQUIRY, READ_10, READ_CAPACITY_10, REQUEST_SENSE, TEST_UNIT_READY, WRITE_10};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SenseFormat {
    Fixed,
    Descriptor,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Command {
    TestUnitReady,
    RequestSense(SenseFormat),
    /// Standard INQUIRY data only; VPD pages are rejected while parsing.
    Inquiry,
    ReadCapacity10,
    Read10 {
        /// Force unit access (i.e. bypass cache)
        fua: bool,
        lba: u32,
        transfer_length: u16,
    },
    Write10 {
        fua: bool,
        lba: u32,
        transfer_length: u16,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    TestUnitReady,
    RequestSense,
    Inquiry,
    ReadCapacity10,
    Read10,
    Write10,
}

pub const OPCODES: &[(CommandType, u8)] = &[
    (CommandType::TestUnitReady, TEST_UNIT_READY),
    (CommandType::RequestSense, REQUEST_SENSE),
    (CommandType::Inquiry, INQUIRY),
    (CommandType::ReadCapacity10, READ_CAPACITY_10),
    (CommandType::Read10, READ_10),
    (CommandType::Write10, WRITE_10),
];

impl CommandType {
    fn from_opcode(opcode: u8) -> Option<Self> {
        OPCODES
            .iter()
            .find(|&&(_, x)| x == opcode)
            .map(|&(ty, _)| ty)
    }

    pub const fn cdb_len(self) -> usize {
        match self {
            CommandType::TestUnitReady | CommandType::RequestSense | CommandType::Inquiry => 6,
            CommandType::ReadCapacity10 | CommandType::Read10 | CommandType::Write10 => 10,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ParseError {
    /// The opcode is unknown, i.e. we should respond with INVALID COMMAND
    /// OPERATION CODE
    InvalidCommand,
    /// Another field of the CDB is invalid, i.e. we should respond with
    /// INVALID FIELD IN CDB.
    InvalidField,
    /// The CDB has fewer bytes than necessary for its opcode.
    TooSmall,
}

/// The data phase a command needs, in bytes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DataIntent {
    None,
    /// At most this many bytes, device to host.
    In(u32),
    /// Exactly this many bytes, host to device.
    Out(u32),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Cdb {
    pub command: Command,
    pub allocation_length: Option<u32>,
}

impl Cdb {
    pub fn parse(cdb: &[u8]) -> Result<Self, ParseError> {
        let ct = cdb
            .first()
            .and_then(|&opcode| CommandType::from_opcode(opcode))
            .ok_or(ParseError::InvalidCommand)?;
        if cdb.len() < ct.cdb_len() {
            return Err(ParseError::TooSmall);
        }
        let cdb = &cdb[..ct.cdb_len()];

        match ct {
            CommandType::TestUnitReady => Ok(Self {
                command: Command::TestUnitReady,
                allocation_length: None,
            }),
            CommandType::RequestSense => {
                let format = if cdb[1] & 0b0000_0001 == 1 {
                    SenseFormat::Descriptor
                } else {
                    SenseFormat::Fixed
                };
                Ok(Self {
                    command: Command::RequestSense(format),
                    allocation_length: Some(u32::from(cdb[4])),
                })
            }
            CommandType::Inquiry => {
                if cdb[1] != 0 || cdb[2] != 0 {
                    warn!(
                        "Rejecting INQUIRY for VPD page {:#04x} (flags {:#04x})",
                        cdb[2], cdb[1]
                    );
                    return Err(ParseError::InvalidField);
                }
                Ok(Self {
                    command: Command::Inquiry,
                    allocation_length: Some(u32::from(u16::from_be_bytes([cdb[3], cdb[4]]))),
                })
            }
            CommandType::ReadCapacity10 => Ok(Self {
                command: Command::ReadCapacity10,
                allocation_length: None,
            }),
            CommandType::Read10 | CommandType::Write10 => {
                if cdb[1] & 0b1110_0100 != 0 {
                    // protection information and rebuild assist
                    return Err(ParseError::InvalidField);
                }
                let fua = cdb[1] & 0b0000_1000 != 0;
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let transfer_length = u16::from_be_bytes([cdb[7], cdb[8]]);
                let command = if ct == CommandType::Read10 {
                    Command::Read10 {
                        fua,
                        lba,
                        transfer_length,
                    }
                } else {
                    Command::Write10 {
                        fua,
                        lba,
                        transfer_length,
                    }
                };
                Ok(Self {
                    command,
                    allocation_length: None,
                })
            }
        }
    }

    pub fn data_intent(&self, block_size: u32) -> DataIntent {
        match self.command {
            Command::TestUnitReady => DataIntent::None,
            Command::RequestSense(_) | Command::Inquiry => {
                DataIntent::In(self.allocation_length.unwrap_or(0))
            }
            Command::ReadCapacity10 => DataIntent::In(8),
            Command::Read10 {
                transfer_length, ..
            } => DataIntent::In(u32::from(transfer_length).saturating_mul(block_size)),
            Command::Write10 {
                transfer_length, ..
            } => DataIntent::Out(u32::from(transfer_length).saturating_mul(block_size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::scsi;

    #[test]
    fn test_parse_host_commands() {
        let cdb = Cdb::parse(&scsi::inquiry(0x24)).unwrap();
        assert_eq!(cdb.command, Command::Inquiry);
        assert_eq!(cdb.data_intent(512), DataIntent::In(0x24));

        let cdb = Cdb::parse(&scsi::read_10(0x0102_0304)).unwrap();
        assert_eq!(
            cdb.command,
            Command::Read10 {
                fua: false,
                lba: 0x0102_0304,
                transfer_length: 1
            }
        );
        assert_eq!(cdb.data_intent(512), DataIntent::In(512));

        let cdb = Cdb::parse(&scsi::write_10(7)).unwrap();
        assert_eq!(cdb.data_intent(512), DataIntent::Out(512));
    }

    #[test]
    fn test_parse_other_commands() {
        let cdb = Cdb::parse(&[TEST_UNIT_READY, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(cdb.data_intent(512), DataIntent::None);

        let cdb = Cdb::parse(&[REQUEST_SENSE, 0, 0, 0, 18, 0]).unwrap();
        assert_eq!(cdb.command, Command::RequestSense(SenseFormat::Fixed));
        assert_eq!(cdb.data_intent(512), DataIntent::In(18));

        let cdb = Cdb::parse(&[READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(cdb.data_intent(4096), DataIntent::In(8));
    }

    #[test]
    fn test_parse_errors() {
        assert_matches!(Cdb::parse(&[0xff, 0, 0, 0, 0, 0]), Err(ParseError::InvalidCommand));
        assert_matches!(Cdb::parse(&[]), Err(ParseError::InvalidCommand));
        assert_matches!(Cdb::parse(&[READ_10, 0, 0, 0]), Err(ParseError::TooSmall));
        // EVPD
        assert_matches!(
            Cdb::parse(&[INQUIRY, 1, 0x80, 0, 0xff, 0]),
            Err(ParseError::InvalidField)
        );
        // RDPROTECT
        assert_matches!(
            Cdb::parse(&[READ_10, 0b0010_0000, 0, 0, 0, 0, 0, 0, 1, 0]),
            Err(ParseError::InvalidField)
        );
    }
}
