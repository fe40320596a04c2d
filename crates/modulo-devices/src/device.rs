/*!
 * Module handle and core device abstractions.
 *
 * A [`ModuleHandle`] is the application-side record of one physical
 * peripheral board: what type it is, which logical device it is bound to,
 * which bus address it currently answers on, and whether it is reachable.
 * Handles live inside the [`DeviceRegistry`](crate::registry::DeviceRegistry)
 * owned by a [`BusContext`](crate::context::BusContext).
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modulo_core::types::{BusAddress, DeviceId};

use crate::devices::Driver;
use crate::protocol::TransportError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No unclaimed device of the requested type answered the scan
    #[error("No unclaimed device of type {device_type} found on the bus")]
    NoMatchingDevice {
        /// The type that was searched for
        device_type: String,
    },

    /// Another registered handle is already bound to this device
    #[error("Device {device_id} is already claimed by another handle")]
    AlreadyClaimed {
        /// The contested device
        device_id: DeviceId,
    },

    /// The bus could not report an address for the device
    #[error("Device {device_id} is unreachable: {source}")]
    Unreachable {
        /// The device that was queried
        device_id: DeviceId,
        /// The underlying transport failure
        source: TransportError,
    },

    /// Every assignable bus address has been handed out
    #[error("No free bus addresses left")]
    AddressSpaceExhausted,

    /// The handle is marked disconnected and must be re-resolved first
    #[error("Device not connected")]
    Disconnected,

    /// Every transfer attempt failed
    #[error("Transfer failed after {attempts} attempts")]
    TransferFailed {
        /// Number of attempts made
        attempts: u8,
    },

    /// The handle key does not refer to a live handle
    #[error("Unknown module handle")]
    UnknownHandle,

    /// A driver was handed an argument the device cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport error outside the retry path
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Reachability of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Constructed, never successfully used yet
    Pending,
    /// An address has been used successfully
    Connected,
    /// Transfers exhausted their attempts; calls fast-fail until re-resolved
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// One peripheral board as seen by the host
#[derive(Debug)]
pub struct ModuleHandle {
    device_type: String,
    device_id: DeviceId,
    address: BusAddress,
    state: ConnectionState,
    pub(crate) driver: Driver,
}

impl ModuleHandle {
    /// Create a handle that binds to the first unclaimed device of `device_type`
    pub fn new(device_type: impl Into<String>, driver: Driver) -> Self {
        Self::with_device_id(device_type, DeviceId::UNBOUND, driver)
    }

    /// Create a handle bound to a specific device
    pub fn with_device_id(device_type: impl Into<String>, device_id: DeviceId, driver: Driver) -> Self {
        Self {
            device_type: device_type.into(),
            device_id,
            address: BusAddress::UNRESOLVED,
            state: ConnectionState::Pending,
            driver,
        }
    }

    /// The peripheral class this handle drives
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// The bound logical device, `DeviceId::UNBOUND` until discovery succeeds
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The current bus address, `BusAddress::UNRESOLVED` until resolved
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Current reachability
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the handle has been used successfully and not lost since
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the handle currently has a usable address
    pub fn is_resolved(&self) -> bool {
        !self.address.is_unresolved()
    }

    /// The driver attached to this handle
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub(crate) fn bind(&mut self, device_id: DeviceId) {
        self.device_id = device_id;
    }

    pub(crate) fn set_address(&mut self, address: BusAddress) {
        self.address = address;
    }

    pub(crate) fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Drop the address and fast-fail until the handle is resolved again
    pub(crate) fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.address = BusAddress::UNRESOLVED;
    }

    /// Forget the address after a bus-wide reset
    pub(crate) fn reset(&mut self) {
        self.address = BusAddress::UNRESOLVED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_unresolved() {
        let handle = ModuleHandle::new("co.modulo.io", Driver::Generic);
        assert_eq!(handle.device_type(), "co.modulo.io");
        assert!(handle.device_id().is_unbound());
        assert!(handle.address().is_unresolved());
        assert_eq!(handle.state(), ConnectionState::Pending);
        assert!(!handle.is_connected());
    }

    #[test]
    fn test_disconnect_clears_address() {
        let mut handle = ModuleHandle::with_device_id("co.modulo.io", DeviceId::new(4), Driver::Generic);
        handle.set_address(BusAddress::new(10));
        handle.mark_connected();
        assert!(handle.is_connected());
        assert!(handle.is_resolved());

        handle.mark_disconnected();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.is_resolved());
        assert_eq!(handle.device_id(), DeviceId::new(4));
    }

    #[test]
    fn test_error_messages() {
        let err = DeviceError::NoMatchingDevice {
            device_type: "co.modulo.knob".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No unclaimed device of type co.modulo.knob found on the bus"
        );
        assert_eq!(
            DeviceError::TransferFailed { attempts: 3 }.to_string(),
            "Transfer failed after 3 attempts"
        );
    }
}
