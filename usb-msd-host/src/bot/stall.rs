// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Halt condition of the bulk endpoints, queried and cleared over the default
//! control pipe.

use log::{debug, warn};

use super::session::{BotSession, BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT};
use crate::{
    port::{ControlSetup, TransferPort},
    Error, Result, Stage,
};

/// Halt flag within the status byte checked by [`BotSession::is_stalled`].
const ENDPOINT_HALT: u8 = 0x01;

impl<P: TransferPort> BotSession<P> {
    /// Ask the device whether `endpoint` is halted.
    ///
    /// The answer is taken from the second byte of the GET_STATUS reply.
    pub fn is_stalled(&mut self, endpoint: u8) -> Result<bool> {
        let setup = ControlSetup::get_endpoint_status(endpoint);
        let mut status = [0; 2];
        let control = self.endpoints().control.address;
        let address = self.address();

        self.port_mut()
            .control_request(address, control, &setup, &mut status)
            .map_err(|source| {
                warn!("Could not get status of endpoint {endpoint:#04x}: {source}");
                Error::Transport {
                    stage: Stage::Control,
                    source,
                }
            })?;

        Ok(status[1] & ENDPOINT_HALT != 0)
    }

    /// Clear the halt on `endpoint` and restart its data toggles at DATA0.
    pub fn clear_stall(&mut self, endpoint: u8) -> Result<()> {
        let setup = ControlSetup::clear_endpoint_halt(endpoint);
        let control = self.endpoints().control.address;
        let address = self.address();

        self.port_mut()
            .control_request(address, control, &setup, &mut [])
            .map_err(|source| Error::Transport {
                stage: Stage::Control,
                source,
            })?;

        if let Some(record) = self.endpoints_mut().record_mut(endpoint) {
            record.reset_toggles();
        }
        self.sync_endpoints();
        debug!("Cleared halt on endpoint {endpoint:#04x}");
        Ok(())
    }

    /// The first halted bulk endpoint, bulk-in checked first.
    pub fn halted_data_endpoint(&mut self) -> Result<Option<u8>> {
        for endpoint in [BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT] {
            if self.is_stalled(endpoint)? {
                debug!("Endpoint {endpoint:#04x} is halted");
                return Ok(Some(endpoint));
            }
        }
        Ok(None)
    }

    /// True when neither bulk endpoint is halted.
    pub fn check_data_endpoints(&mut self) -> Result<bool> {
        Ok(self.halted_data_endpoint()?.is_none())
    }
}
