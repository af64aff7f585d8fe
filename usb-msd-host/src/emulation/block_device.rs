// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io::{self, ErrorKind, Write},
    num::{NonZeroU32, NonZeroU64, TryFromIntError},
    ops::{Add, Div, Mul},
    os::unix::prelude::*,
};

use log::{debug, error};
use thiserror::Error as ThisError;

use super::{
    command::{Command, SenseFormat},
    response_data::{respond_standard_inquiry_data, SilentlyTruncate},
};
use crate::{bot::BLOCK_SIZE, scsi::sense::{self, SenseTriple}};

const GOOD: u8 = 0x00;
const CHECK_CONDITION: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
pub struct ByteOffset(u64);
impl From<u64> for ByteOffset {
    fn from(value: u64) -> Self {
        ByteOffset(value)
    }
}
impl From<ByteOffset> for u64 {
    fn from(value: ByteOffset) -> Self {
        value.0
    }
}
impl Div<BlockSize> for ByteOffset {
    type Output = BlockOffset;

    fn div(self, rhs: BlockSize) -> Self::Output {
        BlockOffset(self.0 / NonZeroU64::from(rhs.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
pub struct BlockSize(NonZeroU32);
impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        u32::from(value.0)
    }
}
impl TryFrom<u32> for BlockSize {
    type Error = TryFromIntError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(BlockSize(NonZeroU32::try_from(value)?))
    }
}
impl Default for BlockSize {
    fn default() -> Self {
        Self(NonZeroU32::MIN.saturating_add(BLOCK_SIZE as u32 - 1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
pub struct BlockOffset(u64);
impl From<BlockOffset> for u64 {
    fn from(value: BlockOffset) -> Self {
        value.0
    }
}
impl From<u64> for BlockOffset {
    fn from(value: u64) -> Self {
        BlockOffset(value)
    }
}
impl Add<BlockOffset> for BlockOffset {
    type Output = BlockOffset;

    fn add(self, rhs: BlockOffset) -> Self::Output {
        BlockOffset(self.0 + rhs.0)
    }
}
impl Mul<BlockSize> for BlockOffset {
    type Output = ByteOffset;

    fn mul(self, rhs: BlockSize) -> Self::Output {
        ByteOffset(self.0 * u64::from(NonZeroU64::from(rhs.0)))
    }
}

pub trait BlockDeviceBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: ByteOffset) -> io::Result<()>;
    fn write_exact_at(&mut self, buf: &[u8], offset: ByteOffset) -> io::Result<()>;
    fn size_in_blocks(&mut self) -> io::Result<BlockOffset>;
    fn block_size(&self) -> BlockSize;
    fn sync(&mut self) -> io::Result<()>;
}

/// Disk image file. A trailing partial block is not addressable.
pub struct FileBackend {
    file: File,
    block_size: BlockSize,
}

impl FileBackend {
    pub fn new(file: File) -> Self {
        Self {
            file,
            block_size: BlockSize::default(),
        }
    }
}

impl BlockDeviceBackend for FileBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: ByteOffset) -> io::Result<()> {
        self.file.read_exact_at(buf, u64::from(offset))
    }

    fn write_exact_at(&mut self, buf: &[u8], offset: ByteOffset) -> io::Result<()> {
        self.file.write_all_at(buf, u64::from(offset))
    }

    fn size_in_blocks(&mut self) -> io::Result<BlockOffset> {
        let len = ByteOffset::from(self.file.metadata()?.len());
        Ok(len / self.block_size)
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Zero-filled in-memory disk.
pub struct MemoryBackend {
    data: Vec<u8>,
    block_size: BlockSize,
}

impl MemoryBackend {
    pub fn new(blocks: u64) -> Self {
        let block_size = BlockSize::default();
        let len = usize::try_from(u64::from(BlockOffset(blocks) * block_size)).unwrap_or(0);
        Self {
            data: vec![0; len],
            block_size,
        }
    }

    fn range(&self, len: usize, offset: ByteOffset) -> io::Result<std::ops::Range<usize>> {
        usize::try_from(u64::from(offset))
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.data.len())
            .ok_or_else(|| io::Error::from(ErrorKind::UnexpectedEof))
    }
}

impl BlockDeviceBackend for MemoryBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: ByteOffset) -> io::Result<()> {
        let range = self.range(buf.len(), offset)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_exact_at(&mut self, buf: &[u8], offset: ByteOffset) -> io::Result<()> {
        let range = self.range(buf.len(), offset)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn size_in_blocks(&mut self) -> io::Result<BlockOffset> {
        Ok(ByteOffset(self.data.len() as u64) / self.block_size)
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// SCSI status of a completed command. Sense data is kept by the logical
/// unit until the next REQUEST SENSE, as there is no autosense over BOT.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CmdOutput {
    pub status: u8,
    pub sense: SenseTriple,
}

impl CmdOutput {
    pub const fn ok() -> Self {
        Self {
            status: GOOD,
            sense: sense::NO_ADDITIONAL_SENSE_INFORMATION,
        }
    }

    pub const fn check_condition(sense: SenseTriple) -> Self {
        Self {
            status: CHECK_CONDITION,
            sense,
        }
    }

    pub const fn is_good(&self) -> bool {
        self.status == GOOD
    }
}

/// A transport-level error encountered while processing a SCSI command.
#[derive(Debug, ThisError)]
pub enum CmdError {
    #[error("Failed writing data-in response: {0}")]
    DataIn(io::Error),
    #[error("Data-out buffer holds {actual} bytes, command needs {expected}")]
    DataOutTooShort { expected: usize, actual: usize },
}

pub struct BlockDevice<T: BlockDeviceBackend> {
    backend: T,
    write_protected: bool,
    sense: SenseTriple,
}

impl<T: BlockDeviceBackend> BlockDevice<T> {
    pub const fn new(backend: T) -> Self {
        Self {
            backend,
            write_protected: false,
            sense: sense::NO_ADDITIONAL_SENSE_INFORMATION,
        }
    }

    pub fn set_write_protected(&mut self, wp: bool) {
        self.write_protected = wp;
    }

    pub fn block_size(&self) -> u32 {
        u32::from(self.backend.block_size())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.backend.sync()
    }

    /// Record `sense` for the next REQUEST SENSE and fail the command with it.
    pub fn report(&mut self, sense: SenseTriple) -> CmdOutput {
        self.sense = sense;
        CmdOutput::check_condition(sense)
    }

    /// Check that a transfer of `blocks` blocks at `lba` can be carried out.
    pub fn check_access(&mut self, lba: u32, blocks: u16, write: bool) -> Result<(), SenseTriple> {
        if write && self.write_protected {
            return Err(sense::WRITE_PROTECTED);
        }
        let size = self.backend.size_in_blocks().map_err(|e| {
            error!("Error getting image size: {e}");
            sense::TARGET_FAILURE
        })?;
        if BlockOffset(lba.into()) + BlockOffset(blocks.into()) > size {
            return Err(sense::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE);
        }
        Ok(())
    }

    fn read_blocks(&mut self, lba: BlockOffset, blocks: BlockOffset) -> io::Result<Vec<u8>> {
        let len = usize::try_from(u64::from(blocks * self.backend.block_size()))
            .map_err(|_| io::Error::from(ErrorKind::InvalidInput))?;
        let mut ret = vec![0; len];
        self.backend
            .read_exact_at(&mut ret[..], lba * self.backend.block_size())?;
        Ok(ret)
    }

    pub fn execute_command(
        &mut self,
        data_in: &mut SilentlyTruncate<&mut dyn Write>,
        data_out: &[u8],
        command: Command,
    ) -> Result<CmdOutput, CmdError> {
        debug!("Incoming command: {command:?}");

        match command {
            Command::TestUnitReady => Ok(CmdOutput::ok()),
            Command::RequestSense(format) => match format {
                SenseFormat::Fixed => {
                    let sense = std::mem::replace(
                        &mut self.sense,
                        sense::NO_ADDITIONAL_SENSE_INFORMATION,
                    );
                    data_in
                        .write_all(&sense.to_fixed_sense())
                        .map_err(CmdError::DataIn)?;
                    Ok(CmdOutput::ok())
                }
                // Don't support descriptor format.
                SenseFormat::Descriptor => Ok(self.report(sense::INVALID_FIELD_IN_CDB)),
            },
            Command::Inquiry => {
                respond_standard_inquiry_data(data_in).map_err(CmdError::DataIn)?;
                Ok(CmdOutput::ok())
            }
            Command::ReadCapacity10 => match self.backend.size_in_blocks() {
                Ok(size) if u64::from(size) > 0 => {
                    // last block, not length; saturates for images past 2 TiB
                    let final_block =
                        u32::try_from(u64::from(size) - 1).unwrap_or(0xffff_ffff);
                    let block_size = u32::from(self.backend.block_size());
                    data_in
                        .write_all(&final_block.to_be_bytes())
                        .map_err(CmdError::DataIn)?;
                    data_in
                        .write_all(&block_size.to_be_bytes())
                        .map_err(CmdError::DataIn)?;
                    Ok(CmdOutput::ok())
                }
                Ok(_) => Ok(self.report(sense::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE)),
                Err(e) => {
                    error!("Error getting image size: {e}");
                    Ok(self.report(sense::UNRECOVERED_READ_ERROR))
                }
            },
            Command::Read10 {
                fua,
                lba,
                transfer_length,
            } => {
                if fua {
                    if let Err(e) = self.backend.sync() {
                        error!("Error syncing file: {e}");
                        return Ok(self.report(sense::TARGET_FAILURE));
                    }
                }
                if let Err(sense) = self.check_access(lba, transfer_length, false) {
                    return Ok(self.report(sense));
                }

                match self.read_blocks(BlockOffset(lba.into()), BlockOffset(transfer_length.into())) {
                    Ok(bytes) => {
                        data_in.write_all(&bytes).map_err(CmdError::DataIn)?;
                        Ok(CmdOutput::ok())
                    }
                    Err(e) => {
                        error!("Error reading image: {e}");
                        Ok(self.report(sense::UNRECOVERED_READ_ERROR))
                    }
                }
            }
            Command::Write10 {
                fua,
                lba,
                transfer_length,
            } => {
                if let Err(sense) = self.check_access(lba, transfer_length, true) {
                    return Ok(self.report(sense));
                }

                let block_size = self.backend.block_size();
                let len = usize::try_from(u64::from(
                    BlockOffset(transfer_length.into()) * block_size,
                ))
                .unwrap_or(usize::MAX);
                let buf = data_out.get(..len).ok_or(CmdError::DataOutTooShort {
                    expected: len,
                    actual: data_out.len(),
                })?;

                let write_result = self
                    .backend
                    .write_exact_at(buf, BlockOffset(lba.into()) * block_size);

                if fua {
                    if let Err(e) = self.backend.sync() {
                        error!("Error syncing file: {e}");
                        return Ok(self.report(sense::TARGET_FAILURE));
                    }
                }

                match write_result {
                    Ok(()) => Ok(CmdOutput::ok()),
                    Err(e) => {
                        error!("Error writing to block device: {e}");
                        Ok(self.report(sense::TARGET_FAILURE))
                    }
                }
            }
        }
    }
}
