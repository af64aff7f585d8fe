// Host-side USB mass storage client (Bulk-Only Transport)
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

pub mod bot;
pub mod device;
pub mod emulation;
pub mod port;
pub mod scsi;

use std::fmt;

use thiserror::Error as ThisError;

pub use bot::session::{BotSession, DataPhase, DataPhasePolicy};
pub use device::{DeviceConfig, DeviceState, MassStorage};
pub use port::{TransferError, TransferPort};

pub type Result<T> = std::result::Result<T, Error>;

/// The transaction phase or control exchange a transport error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The CBW bulk OUT transfer.
    Command,
    /// The optional bulk data transfer.
    Data,
    /// The CSW bulk IN transfer.
    Status,
    /// A request on the default control pipe.
    Control,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Command => write!(f, "command phase"),
            Stage::Data => write!(f, "data phase"),
            Stage::Status => write!(f, "status phase"),
            Stage::Control => write!(f, "control request"),
        }
    }
}

/// Ways a CSW can fail to conclude the transaction it was read for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Violation {
    #[error("bad CSW signature {0:#010x}")]
    BadSignature(u32),
    #[error("CSW tag {actual:#x} does not match CBW tag {expected:#x}")]
    TagMismatch { expected: u32, actual: u32 },
    #[error("reserved CSW status {0:#04x}")]
    ReservedStatus(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
/// Errors surfaced by the bulk-only transport engine and the device lifecycle
pub enum Error {
    #[error("Transfer failed in {stage}: {source}")]
    Transport {
        stage: Stage,
        source: TransferError,
    },
    #[error("Protocol violation: {0}")]
    ProtocolViolation(Violation),
    #[error("Device rejected the command (residue {residue})")]
    CommandFailed { residue: u32 },
    #[error("Device reported a phase error")]
    PhaseError,
    #[error("Unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnsupportedDevice { vendor_id: u16, product_id: u16 },
    #[error("Device reports max LUN {0}, only LUN 0 is supported")]
    UnsupportedLun(u8),
    #[error("Device is not ready (state: {0})")]
    NotReady(DeviceState),
    #[error("Endpoint {0:#04x} is still halted")]
    EndpointHalted(u8),
    #[error("Data buffer of {actual} bytes does not match CBW transfer length {expected}")]
    DataBufferMismatch { expected: u32, actual: usize },
}

impl Error {
    /// Whether only the mass storage reset sequence can bring the transport
    /// back in sync after this error.
    pub fn is_reset_required(&self) -> bool {
        match self {
            Error::ProtocolViolation(_) | Error::PhaseError | Error::EndpointHalted(_) => true,
            Error::Transport { stage, source } => *stage != Stage::Control && source.is_stall(),
            _ => false,
        }
    }
}
