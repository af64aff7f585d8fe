// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A software bulk-only mass storage device behind the `TransferPort` trait.
//!
//! `EmulatedDevice` plays both the host controller and the device at one
//! address: it answers the standard and class control requests the host side
//! issues, runs the device half of the command / data / status exchange, and
//! hands SCSI commands to a single emulated logical unit.

pub mod block_device;
pub mod command;
pub mod response_data;


use std::{
    cmp::min,
    io::{self, Write},
};

use log::{debug, error, warn};

use self::{
    block_device::{BlockDevice, BlockDeviceBackend},
    command::{Cdb, Command, DataIntent, ParseError},
    response_data::SilentlyTruncate,
};
use crate::{
    bot::{
        session::{BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT},
        Cbw, ClassRequest, Csw, CswStatus, Direction, CSW_LEN,
    },
    device::{DEFAULT_CONFIGURATION, DEFAULT_INTERFACE, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID},
    port::{
        ControlSetup, EndpointRecord, TransferError, TransferPort, TransferResult,
        CONTROL_ENDPOINT, DEVICE_DESCRIPTOR_LEN, FEATURE_ENDPOINT_HALT,
        REQ_TYPE_CLASS_INTERFACE_IN, REQ_TYPE_CLASS_INTERFACE_OUT, REQ_TYPE_STANDARD_ENDPOINT_IN,
        REQ_TYPE_STANDARD_ENDPOINT_OUT, REQUEST_CLEAR_FEATURE, REQUEST_GET_STATUS,
    },
    scsi::sense,
};

const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
const CONTROL_MAX_PACKET_SIZE: u16 = 0x40;

/// What the emulated device reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Answer to GET_MAX_LUN; `None` stalls the request.
    pub max_lun: Option<u8>,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            max_lun: Some(0),
        }
    }
}

enum OutAction {
    Execute { tag: u32, cdb: Cdb },
    Discard(Csw),
}

/// Device side of the transaction in progress.
enum Phase {
    /// Waiting for a CBW.
    Idle,
    /// `len` bytes go to the host; bytes past the end of `data` are zero.
    DataIn {
        data: Vec<u8>,
        len: usize,
        sent: usize,
        csw: Csw,
    },
    DataOut {
        buf: Vec<u8>,
        received: usize,
        expected: usize,
        action: OutAction,
    },
    Status(Csw),
}

pub struct EmulatedDevice<T: BlockDeviceBackend> {
    address: u8,
    identity: DeviceIdentity,
    lun: BlockDevice<T>,
    configuration: u8,
    endpoints: Vec<EndpointRecord>,
    bulk_in_halted: bool,
    bulk_out_halted: bool,
    phase: Phase,
}

impl<T: BlockDeviceBackend> EmulatedDevice<T> {
    pub fn new(address: u8, identity: DeviceIdentity, lun: BlockDevice<T>) -> Self {
        Self {
            address,
            identity,
            lun,
            configuration: 0,
            endpoints: Vec::new(),
            bulk_in_halted: false,
            bulk_out_halted: false,
            phase: Phase::Idle,
        }
    }

    /// Currently selected configuration, 0 while unconfigured.
    pub const fn configuration(&self) -> u8 {
        self.configuration
    }

    /// The endpoint table last registered by the host.
    pub fn endpoint_table(&self) -> &[EndpointRecord] {
        &self.endpoints
    }

    pub fn logical_unit_mut(&mut self) -> &mut BlockDevice<T> {
        &mut self.lun
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.lun.sync()
    }

    /// Put a bulk endpoint into the halted state.
    pub fn halt(&mut self, endpoint: u8) {
        match endpoint {
            BULK_IN_ENDPOINT => self.bulk_in_halted = true,
            BULK_OUT_ENDPOINT => self.bulk_out_halted = true,
            _ => warn!("Not halting unknown endpoint {endpoint:#04x}"),
        }
    }

    /// Halt state of `endpoint`, `None` if the device has no such endpoint.
    pub fn is_halted(&self, endpoint: u8) -> Option<bool> {
        match endpoint {
            CONTROL_ENDPOINT => Some(false),
            BULK_IN_ENDPOINT => Some(self.bulk_in_halted),
            BULK_OUT_ENDPOINT => Some(self.bulk_out_halted),
            _ => None,
        }
    }

    pub fn device_descriptor(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let [vid_lo, vid_hi] = self.identity.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.identity.product_id.to_le_bytes();
        let [mps, _] = CONTROL_MAX_PACKET_SIZE.to_le_bytes();
        [
            DEVICE_DESCRIPTOR_LEN as u8,
            DESCRIPTOR_TYPE_DEVICE,
            0x00, 0x02, // USB 2.0
            0, 0, 0, // class defined per interface
            mps,
            vid_lo, vid_hi,
            pid_lo, pid_hi,
            0x00, 0x01, // device release 1.00
            1, 2, 3, // string indices
            1, // configurations
        ]
    }

    fn check_address(&self, device: u8) -> TransferResult {
        if device == self.address {
            Ok(())
        } else {
            Err(TransferError::TIMEOUT)
        }
    }

    fn check_endpoint(endpoint: u8, expected: u8) -> TransferResult {
        if endpoint == expected {
            Ok(())
        } else {
            Err(TransferError::BAD_REQUEST)
        }
    }

    /// Fail the command announced by `cbw`. If the host expects data, the
    /// data endpoint in its direction is halted.
    fn fail(&mut self, cbw: &Cbw) {
        if cbw.data_transfer_length != 0 {
            match cbw.direction {
                Direction::In => self.bulk_in_halted = true,
                Direction::Out => self.bulk_out_halted = true,
            }
        }
        self.phase = Phase::Status(Csw::new(
            cbw.tag,
            cbw.data_transfer_length,
            CswStatus::Failed,
        ));
    }

    /// Host and device disagree about the data phase: move the amount of data
    /// the host asked for, then report a phase error.
    fn phase_error(&mut self, cbw: &Cbw) {
        let len = cbw.data_transfer_length as usize;
        let csw = Csw::new(cbw.tag, cbw.data_transfer_length, CswStatus::PhaseError);
        self.phase = match (len, cbw.direction) {
            (0, _) => Phase::Status(csw),
            (_, Direction::In) => Phase::DataIn {
                data: Vec::new(),
                len,
                sent: 0,
                csw,
            },
            (_, Direction::Out) => Phase::DataOut {
                buf: Vec::new(),
                received: 0,
                expected: len,
                action: OutAction::Discard(csw),
            },
        };
    }

    fn receive_cbw(&mut self, raw: &[u8]) {
        let cbw = match Cbw::parse(raw) {
            Ok(cbw) => cbw,
            Err(e) => {
                warn!("Invalid CBW ({e}), halting both bulk endpoints");
                self.bulk_in_halted = true;
                self.bulk_out_halted = true;
                return;
            }
        };

        let cdb = if cbw.lun != 0 {
            Err(sense::LOGICAL_UNIT_NOT_SUPPORTED)
        } else {
            Cdb::parse(cbw.command_block()).map_err(|e| match e {
                ParseError::InvalidCommand => sense::INVALID_COMMAND_OPERATION_CODE,
                ParseError::InvalidField | ParseError::TooSmall => sense::INVALID_FIELD_IN_CDB,
            })
        };
        let cdb = match cdb {
            Ok(cdb) => cdb,
            Err(sense) => {
                debug!("Rejecting CBW tag {:#x}: {sense:?}", cbw.tag);
                self.lun.report(sense);
                self.fail(&cbw);
                return;
            }
        };

        let host = match (cbw.data_transfer_length, cbw.direction) {
            (0, _) => DataIntent::None,
            (len, Direction::In) => DataIntent::In(len),
            (len, Direction::Out) => DataIntent::Out(len),
        };
        let intent = cdb.data_intent(self.lun.block_size());
        if host != intent {
            warn!(
                "CBW tag {:#x} announces {host:?} but the command needs {intent:?}",
                cbw.tag
            );
            self.phase_error(&cbw);
            return;
        }

        if let DataIntent::Out(len) = intent {
            if let Command::Write10 {
                lba,
                transfer_length,
                ..
            } = cdb.command
            {
                if let Err(sense) = self.lun.check_access(lba, transfer_length, true) {
                    self.lun.report(sense);
                    self.fail(&cbw);
                    return;
                }
            }
            self.phase = Phase::DataOut {
                buf: Vec::with_capacity(len as usize),
                received: 0,
                expected: len as usize,
                action: OutAction::Execute { tag: cbw.tag, cdb },
            };
            return;
        }

        let len = cbw.data_transfer_length as usize;
        let mut data = Vec::new();
        let result = {
            let mut data_in = SilentlyTruncate::new(&mut data as &mut dyn Write, len);
            self.lun.execute_command(&mut data_in, &[], cdb.command)
        };
        let output = result.unwrap_or_else(|e| {
            error!("Error executing command: {e}");
            self.lun.report(sense::TARGET_FAILURE)
        });
        if !output.is_good() {
            self.fail(&cbw);
            return;
        }

        let residue = (len - data.len()) as u32;
        let csw = Csw::new(cbw.tag, residue, CswStatus::Passed);
        self.phase = if len == 0 {
            Phase::Status(csw)
        } else {
            Phase::DataIn {
                data,
                len,
                sent: 0,
                csw,
            }
        };
    }

    fn receive_data(&mut self, data: &[u8]) -> TransferResult {
        let Phase::DataOut {
            buf,
            received,
            expected,
            action,
        } = &mut self.phase
        else {
            return Err(TransferError::NAK);
        };

        if data.len() > *expected - *received {
            return Err(TransferError::BAD_REQUEST);
        }
        if let OutAction::Execute { .. } = action {
            buf.extend_from_slice(data);
        }
        *received += data.len();
        if *received < *expected {
            return Ok(());
        }

        if let Phase::DataOut { buf, action, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            let csw = self.complete_data_out(&buf, action);
            self.phase = Phase::Status(csw);
        }
        Ok(())
    }

    fn complete_data_out(&mut self, buf: &[u8], action: OutAction) -> Csw {
        let (tag, cdb) = match action {
            OutAction::Discard(csw) => return csw,
            OutAction::Execute { tag, cdb } => (tag, cdb),
        };

        let mut sink = io::sink();
        let mut data_in = SilentlyTruncate::new(&mut sink as &mut dyn Write, 0);
        let output = self
            .lun
            .execute_command(&mut data_in, buf, cdb.command)
            .unwrap_or_else(|e| {
                error!("Error executing command: {e}");
                self.lun.report(sense::TARGET_FAILURE)
            });

        if output.is_good() {
            Csw::new(tag, 0, CswStatus::Passed)
        } else {
            Csw::new(tag, buf.len() as u32, CswStatus::Failed)
        }
    }

    fn class_request(&mut self, setup: &ControlSetup, data: &mut [u8]) -> TransferResult {
        if setup.index != u16::from(DEFAULT_INTERFACE) || self.configuration == 0 {
            return Err(TransferError::STALL);
        }

        match ClassRequest::try_from(setup.request) {
            Ok(ClassRequest::GetMaxLun) if setup.request_type == REQ_TYPE_CLASS_INTERFACE_IN => {
                let max_lun = self.identity.max_lun.ok_or(TransferError::STALL)?;
                if let Some(byte) = data.first_mut() {
                    *byte = max_lun;
                }
                Ok(())
            }
            Ok(ClassRequest::MassStorageReset)
                if setup.request_type == REQ_TYPE_CLASS_INTERFACE_OUT =>
            {
                debug!("Bulk-only mass storage reset");
                self.phase = Phase::Idle;
                Ok(())
            }
            _ => Err(TransferError::STALL),
        }
    }
}

impl<T: BlockDeviceBackend> TransferPort for EmulatedDevice<T> {
    fn control_request(
        &mut self,
        device: u8,
        endpoint: u8,
        setup: &ControlSetup,
        data: &mut [u8],
    ) -> TransferResult {
        self.check_address(device)?;
        Self::check_endpoint(endpoint, CONTROL_ENDPOINT)?;

        match (setup.request_type, setup.request) {
            (REQ_TYPE_STANDARD_ENDPOINT_IN, REQUEST_GET_STATUS) => {
                let halted = u8::try_from(setup.index)
                    .ok()
                    .and_then(|ep| self.is_halted(ep))
                    .ok_or(TransferError::STALL)?;
                let status = [0, u8::from(halted)];
                let len = min(data.len(), status.len());
                data[..len].copy_from_slice(&status[..len]);
                Ok(())
            }
            (REQ_TYPE_STANDARD_ENDPOINT_OUT, REQUEST_CLEAR_FEATURE)
                if setup.value == FEATURE_ENDPOINT_HALT =>
            {
                let ep = u8::try_from(setup.index).map_err(|_| TransferError::STALL)?;
                match ep {
                    BULK_IN_ENDPOINT => self.bulk_in_halted = false,
                    BULK_OUT_ENDPOINT => self.bulk_out_halted = false,
                    CONTROL_ENDPOINT => {}
                    _ => return Err(TransferError::STALL),
                }
                if let Some(record) = self.endpoints.iter_mut().find(|r| r.address == ep) {
                    record.reset_toggles();
                }
                Ok(())
            }
            (REQ_TYPE_CLASS_INTERFACE_IN | REQ_TYPE_CLASS_INTERFACE_OUT, _) => {
                self.class_request(setup, data)
            }
            _ => Err(TransferError::STALL),
        }
    }

    fn bulk_out(&mut self, device: u8, endpoint: u8, data: &[u8]) -> TransferResult {
        self.check_address(device)?;
        Self::check_endpoint(endpoint, BULK_OUT_ENDPOINT)?;
        if self.configuration == 0 {
            return Err(TransferError::TIMEOUT);
        }
        if self.bulk_out_halted {
            return Err(TransferError::STALL);
        }

        match self.phase {
            Phase::Idle => {
                self.receive_cbw(data);
                Ok(())
            }
            Phase::DataOut { .. } => self.receive_data(data),
            Phase::DataIn { .. } | Phase::Status(_) => Err(TransferError::NAK),
        }
    }

    fn bulk_in(&mut self, device: u8, endpoint: u8, data: &mut [u8]) -> TransferResult {
        self.check_address(device)?;
        Self::check_endpoint(endpoint, BULK_IN_ENDPOINT)?;
        if self.configuration == 0 {
            return Err(TransferError::TIMEOUT);
        }
        if self.bulk_in_halted {
            return Err(TransferError::STALL);
        }

        let next = match &mut self.phase {
            Phase::DataIn {
                data: pending,
                len,
                sent,
                csw,
            } => {
                if data.len() > *len - *sent {
                    return Err(TransferError::BAD_REQUEST);
                }
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = pending.get(*sent + i).copied().unwrap_or(0);
                }
                *sent += data.len();
                (*sent == *len).then_some(Phase::Status(*csw))
            }
            Phase::Status(csw) => {
                if data.len() != CSW_LEN {
                    return Err(TransferError::BAD_REQUEST);
                }
                data.copy_from_slice(&csw.to_bytes());
                Some(Phase::Idle)
            }
            Phase::Idle | Phase::DataOut { .. } => return Err(TransferError::NAK),
        };

        if let Some(next) = next {
            self.phase = next;
        }
        Ok(())
    }

    fn get_device_descriptor(&mut self, device: u8, endpoint: u8, data: &mut [u8]) -> TransferResult {
        self.check_address(device)?;
        Self::check_endpoint(endpoint, CONTROL_ENDPOINT)?;
        let descriptor = self.device_descriptor();
        let len = min(data.len(), descriptor.len());
        data[..len].copy_from_slice(&descriptor[..len]);
        Ok(())
    }

    fn set_configuration(&mut self, device: u8, endpoint: u8, value: u8) -> TransferResult {
        self.check_address(device)?;
        Self::check_endpoint(endpoint, CONTROL_ENDPOINT)?;
        if value != 0 && value != DEFAULT_CONFIGURATION {
            return Err(TransferError::STALL);
        }

        debug!("Configuration {value} selected");
        self.configuration = value;
        self.bulk_in_halted = false;
        self.bulk_out_halted = false;
        self.phase = Phase::Idle;
        Ok(())
    }

    fn control_endpoint(&self) -> EndpointRecord {
        EndpointRecord::control(CONTROL_MAX_PACKET_SIZE)
    }

    fn set_endpoint_table(&mut self, device: u8, endpoints: &[EndpointRecord]) {
        if device == self.address {
            self.endpoints = endpoints.to_vec();
        }
    }
}
