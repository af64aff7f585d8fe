// Transfer primitives consumed by the bulk-only transport engine
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::fmt;

/// Number of the default control pipe.
pub const CONTROL_ENDPOINT: u8 = 0x00;
/// Direction bit of an endpoint address (set for device-to-host).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// bmAttributes transfer types
pub const ATTR_CONTROL: u8 = 0x00;
pub const ATTR_BULK: u8 = 0x02;

/// bmRequestType values for the requests issued by this crate.
pub const REQ_TYPE_STANDARD_ENDPOINT_IN: u8 = 0x82;
pub const REQ_TYPE_STANDARD_ENDPOINT_OUT: u8 = 0x02;
pub const REQ_TYPE_CLASS_INTERFACE_IN: u8 = 0xa1;
pub const REQ_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

/// Standard requests
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Non-zero status code reported by the transfer primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferError(pub u8);

impl TransferError {
    pub const BUSY: Self = Self(0x01);
    pub const BAD_REQUEST: Self = Self(0x02);
    pub const NAK: Self = Self(0x04);
    pub const STALL: Self = Self(0x05);
    pub const TOGGLE: Self = Self(0x06);
    pub const TIMEOUT: Self = Self(0x0e);

    pub fn is_stall(self) -> bool {
        self == Self::STALL
    }

    fn name(self) -> &'static str {
        match self {
            Self::BUSY => "BUSY",
            Self::BAD_REQUEST => "BAD REQUEST",
            Self::NAK => "NAK",
            Self::STALL => "STALL",
            Self::TOGGLE => "TOGGLE ERROR",
            Self::TIMEOUT => "TIMEOUT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer failed with status {:#04x} ({})", self.0, self.name())
    }
}

impl std::error::Error for TransferError {}

pub type TransferResult = std::result::Result<(), TransferError>;

/// The setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// GET_STATUS addressed to an endpoint; two bytes of status follow.
    pub const fn get_endpoint_status(endpoint: u8) -> Self {
        Self {
            request_type: REQ_TYPE_STANDARD_ENDPOINT_IN,
            request: REQUEST_GET_STATUS,
            value: 0,
            index: endpoint as u16,
            length: 2,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT)
    pub const fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self {
            request_type: REQ_TYPE_STANDARD_ENDPOINT_OUT,
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint as u16,
            length: 0,
        }
    }

    /// A class-specific request addressed to an interface.
    pub const fn class_interface(request: u8, interface: u8, device_to_host: bool, length: u16) -> Self {
        Self {
            request_type: if device_to_host {
                REQ_TYPE_CLASS_INTERFACE_IN
            } else {
                REQ_TYPE_CLASS_INTERFACE_OUT
            },
            request,
            value: 0,
            index: interface as u16,
            length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataToggle {
    #[default]
    Data0,
    Data1,
}

/// One entry of the per-device endpoint table kept by the host controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRecord {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub send_toggle: DataToggle,
    pub receive_toggle: DataToggle,
}

impl EndpointRecord {
    pub const fn control(max_packet_size: u16) -> Self {
        Self {
            address: CONTROL_ENDPOINT,
            attributes: ATTR_CONTROL,
            max_packet_size,
            interval: 0,
            send_toggle: DataToggle::Data0,
            receive_toggle: DataToggle::Data0,
        }
    }

    pub const fn bulk(address: u8, max_packet_size: u16) -> Self {
        Self {
            address,
            attributes: ATTR_BULK,
            max_packet_size,
            interval: 0,
            send_toggle: DataToggle::Data0,
            receive_toggle: DataToggle::Data0,
        }
    }

    pub fn reset_toggles(&mut self) {
        self.send_toggle = DataToggle::Data0;
        self.receive_toggle = DataToggle::Data0;
    }
}

/// Blocking USB transfer primitive for one host controller.
///
/// Every call runs to completion before returning. A non-zero status from the
/// controller is reported as a `TransferError`; nothing is retried at this
/// level.
pub trait TransferPort {
    /// Issue a control request. `data` holds exactly `setup.length` bytes and
    /// is filled for device-to-host requests.
    fn control_request(
        &mut self,
        device: u8,
        endpoint: u8,
        setup: &ControlSetup,
        data: &mut [u8],
    ) -> TransferResult;

    fn bulk_out(&mut self, device: u8, endpoint: u8, data: &[u8]) -> TransferResult;

    fn bulk_in(&mut self, device: u8, endpoint: u8, data: &mut [u8]) -> TransferResult;

    fn get_device_descriptor(&mut self, device: u8, endpoint: u8, data: &mut [u8]) -> TransferResult;

    fn set_configuration(&mut self, device: u8, endpoint: u8, value: u8) -> TransferResult;

    /// The default control pipe record established during enumeration.
    fn control_endpoint(&self) -> EndpointRecord;

    /// Register the endpoint table the controller uses for `device`.
    fn set_endpoint_table(&mut self, device: u8, endpoints: &[EndpointRecord]);
}
