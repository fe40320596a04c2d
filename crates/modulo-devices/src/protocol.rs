/*!
 * Bus transport definitions for Modulo.
 *
 * The byte-level bus (framing, checksums, timing) lives behind
 * [`BusTransport`]. Everything in this crate talks to hardware only through
 * this trait.
 */
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modulo_core::types::{BusAddress, DeviceId};

/// Error reported by a bus transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing acknowledged the given address
    #[error("No acknowledge from address {address}")]
    NoAcknowledge {
        /// The address that was targeted
        address: BusAddress,
    },

    /// The exchange did not complete in time
    #[error("Bus timeout")]
    Timeout,

    /// The response failed its integrity check
    #[error("Checksum mismatch")]
    Checksum,

    /// The addressed device is not on the bus
    #[error("Device {device_id} not present")]
    DeviceNotPresent {
        /// The device that was targeted
        device_id: DeviceId,
    },

    /// Host-side I/O failure
    #[error("Bus I/O error: {0}")]
    Io(String),
}

/// An asynchronous notification raised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEvent {
    /// The device that raised the event
    pub device_id: DeviceId,
    /// Driver-specific event code
    pub code: u8,
    /// Driver-specific event payload
    pub data: u16,
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Physical bus collaborator
///
/// Implementations perform exactly one bus exchange per call and never retry;
/// retrying and re-binding are handled by the bus context.
pub trait BusTransport: Debug {
    /// One-time bus initialization
    fn setup(&mut self) -> TransportResult<()>;

    /// Broadcast that makes every attached device forget its address
    fn global_reset(&mut self) -> TransportResult<()>;

    /// Smallest present device id greater than or equal to `after`
    fn next_device_id(&mut self, after: DeviceId) -> Option<DeviceId>;

    /// The declared type string of a device, at most `max_len` bytes long
    fn device_type(&mut self, device_id: DeviceId, max_len: usize) -> TransportResult<String>;

    /// The address persisted on a device, `None` if it has not been assigned one
    fn get_address(&mut self, device_id: DeviceId) -> TransportResult<Option<BusAddress>>;

    /// Persist an address on a device
    fn set_address(&mut self, device_id: DeviceId, address: BusAddress) -> TransportResult<()>;

    /// One command/response exchange with the device at `address`
    fn transfer(
        &mut self,
        address: BusAddress,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
    ) -> TransportResult<()>;

    /// Next pending device event, if the transport multiplexes events
    fn next_event(&mut self) -> Option<BusEvent> {
        None
    }
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn setup(&mut self) -> TransportResult<()> {
        (**self).setup()
    }

    fn global_reset(&mut self) -> TransportResult<()> {
        (**self).global_reset()
    }

    fn next_device_id(&mut self, after: DeviceId) -> Option<DeviceId> {
        (**self).next_device_id(after)
    }

    fn device_type(&mut self, device_id: DeviceId, max_len: usize) -> TransportResult<String> {
        (**self).device_type(device_id, max_len)
    }

    fn get_address(&mut self, device_id: DeviceId) -> TransportResult<Option<BusAddress>> {
        (**self).get_address(device_id)
    }

    fn set_address(&mut self, device_id: DeviceId, address: BusAddress) -> TransportResult<()> {
        (**self).set_address(device_id, address)
    }

    fn transfer(
        &mut self,
        address: BusAddress,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
    ) -> TransportResult<()> {
        (**self).transfer(address, command, send, receive)
    }

    fn next_event(&mut self) -> Option<BusEvent> {
        (**self).next_event()
    }
}
