// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Lifecycle of the attached mass storage device: the one-time bring-up
//! handshake, the data path gated on it, and bulk-only reset recovery.

use std::fmt;

use log::{debug, info, warn};

use crate::{
    bot::{
        session::{BotSession, DataPhasePolicy, BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT},
        ClassRequest, BLOCK_SIZE,
    },
    port::{ControlSetup, TransferError, TransferPort, DEVICE_DESCRIPTOR_LEN},
    scsi::InquiryData,
    Error, Result, Stage,
};

/// Bus address the disk is enumerated at.
pub const DISK_ADDRESS: u8 = 1;
pub const DEFAULT_VENDOR_ID: u16 = 0x2008;
pub const DEFAULT_PRODUCT_ID: u16 = 0x2018;
pub const DEFAULT_CONFIGURATION: u8 = 1;
pub const DEFAULT_INTERFACE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unconfigured,
    Initializing,
    Ready,
    Resetting,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Unconfigured => "unconfigured",
            DeviceState::Initializing => "initializing",
            DeviceState::Ready => "ready",
            DeviceState::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// Which device to accept and how to talk to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub address: u8,
    /// Only a device with this vendor and product id is brought up.
    pub vendor_id: u16,
    pub product_id: u16,
    pub configuration: u8,
    pub interface: u8,
    pub data_phase: DataPhasePolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: DISK_ADDRESS,
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            configuration: DEFAULT_CONFIGURATION,
            interface: DEFAULT_INTERFACE,
            data_phase: DataPhasePolicy::default(),
        }
    }
}

fn control_error(source: TransferError) -> Error {
    Error::Transport {
        stage: Stage::Control,
        source,
    }
}

/// One bulk-only mass storage device, LUN 0 only.
///
/// Data commands are accepted in the `Ready` state only. An error that
/// leaves the transport out of sync moves the device to `Resetting`, and
/// [`MassStorage::reset`] has to succeed before data commands are accepted
/// again.
pub struct MassStorage<P: TransferPort> {
    config: DeviceConfig,
    state: DeviceState,
    max_lun: Option<u8>,
    session: BotSession<P>,
}

impl<P: TransferPort> MassStorage<P> {
    pub fn new(port: P, config: DeviceConfig) -> Self {
        Self {
            session: BotSession::new(port, config.address, config.data_phase),
            config,
            state: DeviceState::Unconfigured,
            max_lun: None,
        }
    }

    pub const fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Ready
    }

    /// Last value reported by GET_MAX_LUN.
    pub const fn max_lun(&self) -> Option<u8> {
        self.max_lun
    }

    pub const fn session(&self) -> &BotSession<P> {
        &self.session
    }

    pub fn port(&self) -> &P {
        self.session.port()
    }

    pub fn port_mut(&mut self) -> &mut P {
        self.session.port_mut()
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state != state {
            info!(
                "Device {:#04x}: {} -> {}",
                self.config.address, self.state, state
            );
            self.state = state;
        }
    }

    /// Bring the device up to `Ready`.
    ///
    /// A failed attempt leaves the device in `Initializing`; calling `attach`
    /// again retries the whole handshake.
    pub fn attach(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Ready => return Ok(()),
            DeviceState::Resetting => return Err(Error::NotReady(self.state)),
            DeviceState::Unconfigured | DeviceState::Initializing => {}
        }

        self.set_state(DeviceState::Initializing);
        match self.initialize() {
            Ok(()) => {
                self.set_state(DeviceState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!("Device {:#04x} initialization failed: {e}", self.config.address);
                Err(e)
            }
        }
    }

    fn initialize(&mut self) -> Result<()> {
        self.session.install_endpoints();
        let address = self.config.address;
        let control = self.session.endpoints().control.address;

        let mut descriptor = [0; DEVICE_DESCRIPTOR_LEN];
        self.session
            .port_mut()
            .get_device_descriptor(address, control, &mut descriptor)
            .map_err(control_error)?;

        let vendor_id = u16::from_le_bytes([descriptor[8], descriptor[9]]);
        let product_id = u16::from_le_bytes([descriptor[10], descriptor[11]]);
        if vendor_id != self.config.vendor_id || product_id != self.config.product_id {
            return Err(Error::UnsupportedDevice {
                vendor_id,
                product_id,
            });
        }
        debug!("Found device {vendor_id:04x}:{product_id:04x}");

        self.session
            .port_mut()
            .set_configuration(address, control, self.config.configuration)
            .map_err(control_error)?;

        self.session.inquiry()?;

        let max_lun = self.get_max_lun()?;
        if max_lun != 0 {
            return Err(Error::UnsupportedLun(max_lun));
        }
        Ok(())
    }

    /// Issue GET_MAX_LUN. A device that stalls the request is reported as a
    /// control transport error.
    pub fn get_max_lun(&mut self) -> Result<u8> {
        let setup = ControlSetup::class_interface(
            ClassRequest::GetMaxLun.into(),
            self.config.interface,
            true,
            1,
        );
        let mut max_lun = [0; 1];
        let address = self.config.address;
        let control = self.session.endpoints().control.address;

        self.session
            .port_mut()
            .control_request(address, control, &setup, &mut max_lun)
            .map_err(|source| {
                if source.is_stall() {
                    warn!("GET_MAX_LUN stalled");
                }
                control_error(source)
            })?;

        debug!("Max LUN {}", max_lun[0]);
        self.max_lun = Some(max_lun[0]);
        Ok(max_lun[0])
    }

    fn mass_storage_reset(&mut self) -> Result<()> {
        let setup = ControlSetup::class_interface(
            ClassRequest::MassStorageReset.into(),
            self.config.interface,
            false,
            0,
        );
        let address = self.config.address;
        let control = self.session.endpoints().control.address;

        self.session
            .port_mut()
            .control_request(address, control, &setup, &mut [])
            .map_err(control_error)
    }

    /// Bulk-only reset recovery: MASS_STORAGE_RESET, clear both bulk
    /// endpoints, then INQUIRY to check the device answers again.
    ///
    /// On failure the device stays in `Resetting`.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Ready | DeviceState::Resetting => {}
            state => return Err(Error::NotReady(state)),
        }
        self.set_state(DeviceState::Resetting);

        let result = self.reset_recovery();
        match result {
            Ok(()) => self.set_state(DeviceState::Ready),
            Err(e) => warn!("Reset of device {:#04x} failed: {e}", self.config.address),
        }
        result
    }

    fn reset_recovery(&mut self) -> Result<()> {
        self.mass_storage_reset()?;
        self.session.clear_stall(BULK_IN_ENDPOINT)?;
        self.session.clear_stall(BULK_OUT_ENDPOINT)?;
        self.session.inquiry()?;
        Ok(())
    }

    /// Forget the device: back to `Unconfigured`, with a fresh tag stream and
    /// endpoint table for the next attach.
    pub fn detach(&mut self) {
        self.session.restart();
        self.max_lun = None;
        self.set_state(DeviceState::Unconfigured);
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == DeviceState::Ready {
            Ok(())
        } else {
            Err(Error::NotReady(self.state))
        }
    }

    /// Whether `e` left the transport out of step with the device. Under
    /// `DataPhasePolicy::Abort` any data phase failure leaves the CSW unread.
    fn desynchronized(&self, e: &Error) -> bool {
        let abandoned = self.config.data_phase == DataPhasePolicy::Abort
            && matches!(
                e,
                Error::Transport {
                    stage: Stage::Data,
                    ..
                }
            );
        abandoned || e.is_reset_required()
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.state == DeviceState::Ready && self.desynchronized(e) {
                warn!("{e}; device needs a reset");
                self.set_state(DeviceState::Resetting);
            }
        }
        result
    }

    pub fn inquiry(&mut self) -> Result<InquiryData> {
        self.ensure_ready()?;
        let result = self.session.inquiry();
        self.track(result)
    }

    pub fn read_block(&mut self, lba: u32) -> Result<[u8; BLOCK_SIZE]> {
        self.ensure_ready()?;
        let result = self.session.read_block(lba);
        self.track(result)
    }

    pub fn write_block(&mut self, lba: u32, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.ensure_ready()?;
        let result = self.session.write_block(lba, block);
        self.track(result)
    }

    /// True when neither bulk endpoint is halted.
    pub fn check_data_endpoints(&mut self) -> Result<bool> {
        if self.state == DeviceState::Unconfigured {
            return Err(Error::NotReady(self.state));
        }
        self.session.check_data_endpoints()
    }

    /// Fail with `EndpointHalted` if a bulk endpoint is halted, in which case
    /// a ready device moves to `Resetting`.
    pub fn ensure_data_endpoints_clear(&mut self) -> Result<()> {
        if self.state == DeviceState::Unconfigured {
            return Err(Error::NotReady(self.state));
        }
        let result = match self.session.halted_data_endpoint() {
            Ok(Some(endpoint)) => Err(Error::EndpointHalted(endpoint)),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.track(result)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        emulation::DeviceIdentity,
        port::{tests::DummyPort, REQ_TYPE_CLASS_INTERFACE_IN},
    };

    fn storage_with(port: DummyPort, data_phase: DataPhasePolicy) -> MassStorage<DummyPort> {
        MassStorage::new(
            port,
            DeviceConfig {
                data_phase,
                ..Default::default()
            },
        )
    }

    fn attached() -> MassStorage<DummyPort> {
        let mut storage = storage_with(DummyPort::default(), DataPhasePolicy::Abort);
        storage.attach().unwrap();
        storage
    }

    fn hello() -> [u8; BLOCK_SIZE] {
        let mut block = [0; BLOCK_SIZE];
        block[..13].copy_from_slice(b"Hello, world!");
        block
    }

    #[test]
    fn test_attach() {
        let mut storage = storage_with(DummyPort::default(), DataPhasePolicy::Abort);
        assert_eq!(storage.state(), DeviceState::Unconfigured);
        assert!(!storage.is_ready());

        storage.attach().unwrap();
        assert!(storage.is_ready());
        assert_eq!(storage.max_lun(), Some(0));
        assert_eq!(storage.port().device.configuration(), DEFAULT_CONFIGURATION);
        assert_eq!(storage.port().device.endpoint_table().len(), 3);
        // INQUIRY ran before GET_MAX_LUN
        assert_eq!(storage.port().issued_tags(), vec![1]);
        let get_max_lun = storage.port().control_log.last().copied().unwrap();
        assert_eq!(get_max_lun.request_type, REQ_TYPE_CLASS_INTERFACE_IN);
        assert_eq!(get_max_lun.request, 0xfe);

        // already attached
        storage.attach().unwrap();
        assert_eq!(storage.port().issued_tags(), vec![1]);
    }

    #[test]
    fn test_unsupported_device() {
        let port = DummyPort::with_identity(DeviceIdentity {
            vendor_id: 0x1234,
            ..Default::default()
        });
        let mut storage = storage_with(port, DataPhasePolicy::Abort);

        assert_eq!(
            storage.attach(),
            Err(Error::UnsupportedDevice {
                vendor_id: 0x1234,
                product_id: DEFAULT_PRODUCT_ID
            })
        );
        assert_eq!(storage.state(), DeviceState::Initializing);
        // stopped before SET_CONFIGURATION
        assert_eq!(storage.port().device.configuration(), 0);
        assert!(storage.port().issued.is_empty());
        assert_matches!(storage.read_block(0), Err(Error::NotReady(DeviceState::Initializing)));
    }

    #[test]
    fn test_max_lun() {
        let port = DummyPort::with_identity(DeviceIdentity {
            max_lun: Some(1),
            ..Default::default()
        });
        let mut storage = storage_with(port, DataPhasePolicy::Abort);
        assert_eq!(storage.attach(), Err(Error::UnsupportedLun(1)));
        assert_eq!(storage.max_lun(), Some(1));
        assert!(!storage.is_ready());

        let port = DummyPort::with_identity(DeviceIdentity {
            max_lun: None,
            ..Default::default()
        });
        let mut storage = storage_with(port, DataPhasePolicy::Abort);
        assert_eq!(
            storage.attach(),
            Err(Error::Transport {
                stage: Stage::Control,
                source: TransferError::STALL
            })
        );
        assert_eq!(storage.state(), DeviceState::Initializing);
    }

    #[test]
    fn test_attach_retry() {
        let mut port = DummyPort::default();
        port.configuration_result = Err(TransferError::TIMEOUT);
        let mut storage = storage_with(port, DataPhasePolicy::Abort);

        assert_matches!(
            storage.attach(),
            Err(Error::Transport {
                stage: Stage::Control,
                source: TransferError::TIMEOUT
            })
        );
        assert_eq!(storage.state(), DeviceState::Initializing);

        storage.port_mut().configuration_result = Ok(());
        storage.attach().unwrap();
        assert!(storage.is_ready());
    }

    #[test]
    fn test_not_ready() {
        let mut storage = storage_with(DummyPort::default(), DataPhasePolicy::Abort);
        assert_eq!(
            storage.read_block(0),
            Err(Error::NotReady(DeviceState::Unconfigured))
        );
        assert_eq!(
            storage.write_block(0, &hello()),
            Err(Error::NotReady(DeviceState::Unconfigured))
        );
        assert_matches!(storage.inquiry(), Err(Error::NotReady(_)));
        assert_matches!(storage.reset(), Err(Error::NotReady(DeviceState::Unconfigured)));
        assert_matches!(storage.check_data_endpoints(), Err(Error::NotReady(_)));
        assert!(storage.port().issued.is_empty());
    }

    #[test]
    fn test_hello_world() {
        let mut storage = attached();
        storage.write_block(0, &hello()).unwrap();

        let block = storage.read_block(0).unwrap();
        assert_eq!(&block[..13], b"Hello, world!");
        assert!(block[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_phase_error_then_reset() {
        let mut storage = attached();
        storage.port_mut().csw_patch = vec![(12, 2)];

        assert_eq!(storage.read_block(0), Err(Error::PhaseError));
        assert_eq!(storage.state(), DeviceState::Resetting);
        assert_eq!(
            storage.read_block(0),
            Err(Error::NotReady(DeviceState::Resetting))
        );
        assert_matches!(storage.attach(), Err(Error::NotReady(DeviceState::Resetting)));

        storage.port_mut().csw_patch.clear();
        storage.reset().unwrap();
        assert!(storage.is_ready());
        let inquiry = storage.inquiry().unwrap();
        assert_eq!(inquiry.to_string(), "Generic Flash Disk 8.07");
    }

    #[test]
    fn test_stall_then_reset() {
        let mut storage = attached();
        // past the end of the disk: the device halts bulk-in
        assert_eq!(
            storage.read_block(u32::MAX),
            Err(Error::Transport {
                stage: Stage::Data,
                source: TransferError::STALL
            })
        );
        assert_eq!(storage.state(), DeviceState::Resetting);
        assert!(!storage.check_data_endpoints().unwrap());

        storage.reset().unwrap();
        assert!(storage.check_data_endpoints().unwrap());
        storage.write_block(3, &hello()).unwrap();
        assert_eq!(storage.read_block(3).unwrap(), hello());
    }

    #[test]
    fn test_abandoned_data_phase() {
        let mut storage = attached();
        storage.port_mut().data_result = Err(TransferError::TIMEOUT);
        assert_eq!(
            storage.write_block(6, &hello()),
            Err(Error::Transport {
                stage: Stage::Data,
                source: TransferError::TIMEOUT
            })
        );
        assert_eq!(storage.state(), DeviceState::Resetting);
        storage.port_mut().data_result = Ok(());
        assert_eq!(
            storage.write_block(7, &hello()),
            Err(Error::NotReady(DeviceState::Resetting))
        );

        storage.reset().unwrap();
        storage.write_block(7, &hello()).unwrap();
        assert_eq!(storage.read_block(7).unwrap(), hello());
        assert_eq!(storage.read_block(5).unwrap(), [0; BLOCK_SIZE]);
    }

    #[test]
    fn test_command_failed_keeps_ready() {
        let mut storage = storage_with(DummyPort::default(), DataPhasePolicy::RecoverStatus);
        storage.attach().unwrap();

        assert_eq!(
            storage.read_block(u32::MAX),
            Err(Error::CommandFailed { residue: 512 })
        );
        assert!(storage.is_ready());
        storage.read_block(0).unwrap();
    }

    #[test]
    fn test_failed_reset() {
        let mut storage = attached();
        storage.port_mut().control_result = Err(TransferError::STALL);
        assert_matches!(
            storage.reset(),
            Err(Error::Transport {
                stage: Stage::Control,
                ..
            })
        );
        assert_eq!(storage.state(), DeviceState::Resetting);

        storage.port_mut().control_result = Ok(());
        storage.reset().unwrap();
        assert!(storage.is_ready());
    }

    #[test]
    fn test_reset_sequence() {
        let mut storage = attached();
        let before = storage.port().control_log.len();
        storage.reset().unwrap();

        let requests: Vec<_> = storage.port().control_log[before..]
            .iter()
            .map(|setup| (setup.request_type, setup.request, setup.index))
            .collect();
        assert_eq!(
            requests,
            vec![
                (0x21, 0xff, 0),
                (0x02, 0x01, u16::from(BULK_IN_ENDPOINT)),
                (0x02, 0x01, u16::from(BULK_OUT_ENDPOINT)),
            ]
        );
        // followed by INQUIRY
        assert_eq!(storage.port().issued.last().map(|cbw| cbw[15]), Some(0x12));
    }

    #[test]
    fn test_halted_endpoint() {
        let mut storage = attached();
        storage.ensure_data_endpoints_clear().unwrap();

        storage.port_mut().device.halt(BULK_OUT_ENDPOINT);
        assert_eq!(
            storage.ensure_data_endpoints_clear(),
            Err(Error::EndpointHalted(BULK_OUT_ENDPOINT))
        );
        assert_eq!(storage.state(), DeviceState::Resetting);

        storage.reset().unwrap();
        storage.ensure_data_endpoints_clear().unwrap();
    }

    #[test]
    fn test_tags_across_reset() {
        let mut storage = attached();
        storage.read_block(0).unwrap();
        storage.reset().unwrap();
        storage.write_block(1, &hello()).unwrap();

        let tags = storage.port().issued_tags();
        assert_eq!(tags, vec![1, 2, 3, 4]);
        assert_eq!(storage.session().next_tag(), 5);
    }

    #[test]
    fn test_detach() {
        let mut storage = attached();
        storage.write_block(0, &hello()).unwrap();

        storage.detach();
        assert_eq!(storage.state(), DeviceState::Unconfigured);
        assert_eq!(storage.max_lun(), None);
        assert_eq!(storage.session().next_tag(), 1);
        assert_matches!(storage.read_block(0), Err(Error::NotReady(_)));

        storage.attach().unwrap();
        assert_eq!(storage.read_block(0).unwrap(), hello());
        assert_eq!(storage.port().issued_tags(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            Error::NotReady(DeviceState::Resetting).to_string(),
            "Device is not ready (state: resetting)"
        );
    }
}
