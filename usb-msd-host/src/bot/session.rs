// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! One bulk-only transport session: the tag stream, the endpoint table and the
//! command / data / status exchange.

use log::{debug, warn};

use super::{Cbw, Command, Csw, Direction, TagCounter, BLOCK_SIZE, CSW_LEN, INQUIRY_LEN};
use crate::{
    port::{EndpointRecord, TransferError, TransferPort, ENDPOINT_DIR_IN},
    scsi::InquiryData,
    Error, Result, Stage,
};

pub const BULK_IN_ENDPOINT: u8 = ENDPOINT_DIR_IN | 0x01;
pub const BULK_OUT_ENDPOINT: u8 = 0x01;
pub const BULK_MAX_PACKET_SIZE: u16 = 0x40;

/// What to do when the data phase of a transaction fails at the transport
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPhasePolicy {
    /// Give up on the transaction right away, leaving the CSW unread. The
    /// device needs a reset before it can take another command.
    #[default]
    Abort,
    /// Clear a halted data endpoint and still read the CSW, so the device
    /// stays in step with the host.
    RecoverStatus,
}

/// Control, bulk-in and bulk-out endpoints of the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointTable {
    pub control: EndpointRecord,
    pub bulk_in: EndpointRecord,
    pub bulk_out: EndpointRecord,
}

impl EndpointTable {
    pub const fn new(control: EndpointRecord) -> Self {
        Self {
            control,
            bulk_in: EndpointRecord::bulk(BULK_IN_ENDPOINT, BULK_MAX_PACKET_SIZE),
            bulk_out: EndpointRecord::bulk(BULK_OUT_ENDPOINT, BULK_MAX_PACKET_SIZE),
        }
    }

    pub const fn records(&self) -> [EndpointRecord; 3] {
        [self.control, self.bulk_in, self.bulk_out]
    }

    pub(crate) fn record_mut(&mut self, address: u8) -> Option<&mut EndpointRecord> {
        [&mut self.bulk_in, &mut self.bulk_out]
            .into_iter()
            .find(|record| record.address == address)
    }
}

/// Buffer for the data phase of a transaction. Its length must equal the
/// transfer length of the CBW and its direction the CBW's direction.
#[derive(Debug)]
pub enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataPhase<'_> {
    fn len(&self) -> usize {
        match self {
            DataPhase::None => 0,
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
        }
    }

    fn direction(&self) -> Option<Direction> {
        match self {
            DataPhase::None => None,
            DataPhase::In(_) => Some(Direction::In),
            DataPhase::Out(_) => Some(Direction::Out),
        }
    }
}

pub struct BotSession<P: TransferPort> {
    port: P,
    address: u8,
    endpoints: EndpointTable,
    tags: TagCounter,
    policy: DataPhasePolicy,
}

impl<P: TransferPort> BotSession<P> {
    pub fn new(port: P, address: u8, policy: DataPhasePolicy) -> Self {
        let endpoints = EndpointTable::new(port.control_endpoint());
        Self {
            port,
            address,
            endpoints,
            tags: TagCounter::new(),
            policy,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub const fn address(&self) -> u8 {
        self.address
    }

    pub const fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Tag the next encoded command will carry.
    pub const fn next_tag(&self) -> u32 {
        self.tags.peek()
    }

    /// Fill the endpoint table with fresh records (toggles at DATA0) and hand
    /// it to the controller.
    pub fn install_endpoints(&mut self) {
        self.endpoints = EndpointTable::new(self.port.control_endpoint());
        self.sync_endpoints();
    }

    pub(crate) fn sync_endpoints(&mut self) {
        let records = self.endpoints.records();
        self.port.set_endpoint_table(self.address, &records);
    }

    pub(crate) fn endpoints_mut(&mut self) -> &mut EndpointTable {
        &mut self.endpoints
    }

    /// Drop all per-device state: the tag stream starts over and the endpoint
    /// table goes back to its initial values.
    pub fn restart(&mut self) {
        self.tags = TagCounter::new();
        self.endpoints = EndpointTable::new(self.port.control_endpoint());
    }

    /// Build the CBW for `command`, consuming one tag.
    pub fn encode(&mut self, command: Command) -> Cbw {
        Cbw::for_command(command, self.tags.next_tag())
    }

    /// Run one transaction: CBW out, optional data, CSW in.
    ///
    /// Returns the CSW only if it matched `cbw` and reported success. A CSW
    /// that is malformed or belongs to another command is a protocol
    /// violation, never a success.
    pub fn execute(&mut self, cbw: &Cbw, data: DataPhase<'_>) -> Result<Csw> {
        let expected = cbw.data_transfer_length;
        if data.len() != expected as usize
            || (expected != 0 && data.direction() != Some(cbw.direction))
        {
            return Err(Error::DataBufferMismatch {
                expected,
                actual: data.len(),
            });
        }

        debug!(
            "CBW tag {:#x} opcode {:#04x} length {} {:?}",
            cbw.tag,
            cbw.opcode(),
            expected,
            cbw.direction
        );

        self.port
            .bulk_out(self.address, self.endpoints.bulk_out.address, &cbw.to_bytes())
            .map_err(|source| Error::Transport {
                stage: Stage::Command,
                source,
            })?;

        let data_result = match data {
            DataPhase::In(buf) if !buf.is_empty() => {
                self.port
                    .bulk_in(self.address, self.endpoints.bulk_in.address, buf)
            }
            DataPhase::Out(buf) if !buf.is_empty() => {
                self.port
                    .bulk_out(self.address, self.endpoints.bulk_out.address, buf)
            }
            _ => Ok(()),
        };

        if let Err(source) = data_result {
            let endpoint = match cbw.direction {
                Direction::In => self.endpoints.bulk_in.address,
                Direction::Out => self.endpoints.bulk_out.address,
            };
            return match self.policy {
                DataPhasePolicy::Abort => {
                    warn!(
                        "Data phase of tag {:#x} failed ({source}), abandoning transaction without reading its CSW",
                        cbw.tag
                    );
                    Err(Error::Transport {
                        stage: Stage::Data,
                        source,
                    })
                }
                DataPhasePolicy::RecoverStatus => self.recover_status(cbw, endpoint, source),
            };
        }

        self.read_status(cbw)
    }

    fn recover_status(&mut self, cbw: &Cbw, endpoint: u8, source: TransferError) -> Result<Csw> {
        warn!(
            "Data phase of tag {:#x} failed ({source}), reading CSW anyway",
            cbw.tag
        );
        if self.is_stalled(endpoint)? {
            self.clear_stall(endpoint)?;
        }

        let csw = self.read_status(cbw)?;
        // The device claims success for data that never moved.
        warn!("{csw} reports success after a failed data phase");
        Err(Error::Transport {
            stage: Stage::Data,
            source,
        })
    }

    fn read_status(&mut self, cbw: &Cbw) -> Result<Csw> {
        let mut raw = [0; CSW_LEN];
        self.port
            .bulk_in(self.address, self.endpoints.bulk_in.address, &mut raw)
            .map_err(|source| Error::Transport {
                stage: Stage::Status,
                source,
            })?;

        let csw = Csw::from_bytes(&raw);
        debug!("{csw}");

        match csw.check(cbw) {
            Ok(()) => Ok(csw),
            Err(e) => {
                if e.is_reset_required() {
                    warn!("Transaction with tag {:#x} failed: {e}", cbw.tag);
                } else {
                    debug!("Transaction with tag {:#x} failed: {e}", cbw.tag);
                }
                Err(e)
            }
        }
    }

    /// Probe the device with INQUIRY. The identification strings are only
    /// logged.
    pub fn inquiry(&mut self) -> Result<InquiryData> {
        let cbw = self.encode(Command::Inquiry);
        let mut buf = [0; INQUIRY_LEN];
        self.execute(&cbw, DataPhase::In(&mut buf))?;

        // INQUIRY_LEN covers the standard data, so this can't fail.
        let data = InquiryData::parse(&buf).ok_or(Error::DataBufferMismatch {
            expected: cbw.data_transfer_length,
            actual: buf.len(),
        })?;
        debug!("INQUIRY: {data}");
        Ok(data)
    }

    pub fn read_block(&mut self, lba: u32) -> Result<[u8; BLOCK_SIZE]> {
        let cbw = self.encode(Command::Read10 { lba });
        let mut block = [0; BLOCK_SIZE];
        self.execute(&cbw, DataPhase::In(&mut block))?;
        Ok(block)
    }

    pub fn write_block(&mut self, lba: u32, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        let cbw = self.encode(Command::Write10 { lba });
        self.execute(&cbw, DataPhase::Out(block))?;
        Ok(())
    }
}
