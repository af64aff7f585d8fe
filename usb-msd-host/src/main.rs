// Drive an emulated USB flash disk through the Bulk-Only Transport host
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io::{self, Write},
    num::ParseIntError,
    path::PathBuf,
    process::exit,
};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error as ThisError;
use usb_msd_host::{
    bot::BLOCK_SIZE,
    device::DISK_ADDRESS,
    emulation::{
        block_device::{BlockDevice, FileBackend},
        DeviceIdentity, EmulatedDevice,
    },
    DataPhasePolicy, DeviceConfig, DeviceState, MassStorage, TransferPort,
};

const GREETING: &str = "Hello, world!";

#[derive(Debug, ThisError)]
enum Error {
    #[error("Invalid USB id `{0}`: {1}")]
    InvalidId(String, ParseIntError),
    #[error("Text of {0} bytes does not fit in one block")]
    TextTooLong(usize),
    #[error("Image must hold at least one block")]
    NoBlocks,
    #[error("Cannot create a read-only image")]
    CreateReadOnly,
    #[error("Could not open image `{0}`: {1}")]
    OpenImage(PathBuf, io::Error),
    #[error("Mass storage failure: {0}")]
    Device(#[from] usb_msd_host::Error),
    #[error("Could not flush image: {0}")]
    Sync(io::Error),
    #[error("Could not write output: {0}")]
    Output(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MsdArgs {
    /// Disk image backing the emulated flash disk.
    #[clap(short, long, value_name = "IMAGE")]
    image: PathBuf,

    /// Create the image, or resize it, to this many 512 byte blocks.
    #[clap(long, value_name = "BLOCKS")]
    create_blocks: Option<u64>,

    /// Present the image as write protected.
    #[clap(short, long)]
    read_only: bool,

    /// Vendor id the host accepts, in hex.
    #[clap(long, default_value = "2008")]
    vendor_id: String,

    /// Product id the host accepts, in hex.
    #[clap(long, default_value = "2018")]
    product_id: String,

    /// Read the status wrapper even after a failed data phase.
    #[clap(long)]
    recover_status: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Print the vendor, product and revision reported by INQUIRY.
    Inquiry,
    /// Dump one block.
    Read {
        #[arg(long)]
        lba: u32,
    },
    /// Store text, zero padded, in one block.
    Write {
        #[arg(long)]
        lba: u32,
        #[arg(long)]
        text: String,
    },
    /// Reset the device, zero the first blocks, then store a greeting in
    /// block 0 and read it back.
    Demo {
        #[arg(long, default_value_t = 500)]
        blocks: u32,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct MsdConfiguration {
    image: PathBuf,
    create_blocks: Option<u64>,
    read_only: bool,
    device: DeviceConfig,
    action: Action,
}

fn parse_id(id: &str) -> Result<u16> {
    let digits = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    u16::from_str_radix(digits, 16).map_err(|e| Error::InvalidId(id.to_string(), e))
}

impl TryFrom<MsdArgs> for MsdConfiguration {
    type Error = Error;

    fn try_from(args: MsdArgs) -> Result<Self> {
        if let Action::Write { text, .. } = &args.action {
            if text.len() > BLOCK_SIZE {
                return Err(Error::TextTooLong(text.len()));
            }
        }

        match args.create_blocks {
            Some(0) => return Err(Error::NoBlocks),
            Some(_) if args.read_only => return Err(Error::CreateReadOnly),
            _ => {}
        }

        let data_phase = if args.recover_status {
            DataPhasePolicy::RecoverStatus
        } else {
            DataPhasePolicy::Abort
        };

        Ok(MsdConfiguration {
            device: DeviceConfig {
                vendor_id: parse_id(&args.vendor_id)?,
                product_id: parse_id(&args.product_id)?,
                data_phase,
                ..Default::default()
            },
            image: args.image,
            create_blocks: args.create_blocks,
            read_only: args.read_only,
            action: args.action,
        })
    }
}

fn text_block(text: &str) -> Result<[u8; BLOCK_SIZE]> {
    let bytes = text.as_bytes();
    let mut block = [0; BLOCK_SIZE];
    block
        .get_mut(..bytes.len())
        .ok_or(Error::TextTooLong(bytes.len()))?
        .copy_from_slice(bytes);
    Ok(block)
}

/// The leading text of a block, up to the first NUL.
fn block_text(block: &[u8]) -> String {
    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    String::from_utf8_lossy(&block[..end]).into_owned()
}

fn hex_dump(out: &mut dyn Write, block: &[u8]) -> io::Result<()> {
    for (row, chunk) in block.chunks(16).enumerate() {
        write!(out, "{:04x}:", row * 16)?;
        for byte in chunk {
            write!(out, " {byte:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn open_image(config: &MsdConfiguration) -> Result<File> {
    let open_error = |e| Error::OpenImage(config.image.clone(), e);
    let file = File::options()
        .read(true)
        .write(!config.read_only)
        .create(config.create_blocks.is_some())
        .truncate(false)
        .open(&config.image)
        .map_err(open_error)?;

    if let Some(blocks) = config.create_blocks {
        file.set_len(blocks * BLOCK_SIZE as u64).map_err(open_error)?;
    }
    Ok(file)
}

fn perform<P: TransferPort>(
    storage: &mut MassStorage<P>,
    action: &Action,
    out: &mut dyn Write,
) -> Result<()> {
    match action {
        Action::Inquiry => {
            let inquiry = storage.inquiry()?;
            writeln!(out, "{inquiry}")?;
        }
        Action::Read { lba } => {
            let block = storage.read_block(*lba)?;
            hex_dump(out, &block)?;
        }
        Action::Write { lba, text } => {
            storage.write_block(*lba, &text_block(text)?)?;
        }
        Action::Demo { blocks } => {
            storage.reset()?;
            storage.ensure_data_endpoints_clear()?;

            let zero = [0; BLOCK_SIZE];
            for lba in 0..*blocks {
                if let Err(e) = storage.write_block(lba, &zero) {
                    warn!("Write of block {lba} failed: {e}");
                    if !storage.is_ready() {
                        storage.reset()?;
                    }
                }
            }

            storage.write_block(0, &text_block(GREETING)?)?;
            let block = storage.read_block(0)?;
            writeln!(out, "{}", block_text(&block))?;
        }
    }
    Ok(())
}

fn run(config: MsdConfiguration, out: &mut dyn Write) -> Result<()> {
    let mut lun = BlockDevice::new(FileBackend::new(open_image(&config)?));
    lun.set_write_protected(config.read_only);

    let port = EmulatedDevice::new(DISK_ADDRESS, DeviceIdentity::default(), lun);
    let mut storage = MassStorage::new(port, config.device);
    storage.attach()?;
    info!("Device attached, running {:?}", config.action);

    let result = perform(&mut storage, &config.action, out);
    if result.is_err() && storage.state() == DeviceState::Resetting {
        if let Err(e) = storage.reset() {
            warn!("Recovery reset failed: {e}");
        }
    }

    storage.port_mut().sync().map_err(Error::Sync)?;
    result
}

fn main() {
    env_logger::init();

    let result = MsdConfiguration::try_from(MsdArgs::parse())
        .and_then(|config| run(config, &mut io::stdout().lock()));
    if let Err(e) = result {
        error!("{e}");
        exit(1);
    }
}
