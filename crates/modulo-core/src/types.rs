/*!
 * Core data types for Modulo.
 *
 * Bus-level identities are small integers with reserved sentinel values. They
 * are wrapped here so a logical device identifier can never be passed where a
 * short-form bus address is expected, and so the sentinels have names.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// The logical identifier of a physical device on the bus.
///
/// Stable per device across resets. `DeviceId::UNBOUND` (all ones) marks a
/// handle that has not been bound to a device yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u16);

impl DeviceId {
    /// Wildcard sentinel: discover automatically by type
    pub const UNBOUND: DeviceId = DeviceId(0xFFFF);

    /// Create a device id from its raw value
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Whether this is the wildcard sentinel
    pub const fn is_unbound(self) -> bool {
        self.0 == Self::UNBOUND.0
    }

    /// The next identifier in scan order, or `None` once the sentinel is reached
    pub fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) if raw != Self::UNBOUND.0 => Some(Self(raw)),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbound() {
            write!(f, "unbound")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u16> for DeviceId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// A short-form bus address assigned by the host.
///
/// `BusAddress::UNRESOLVED` (0xFF) means the handle has not resolved an
/// address yet. Addresses up to and including `BusAddress::LAST_RESERVED`
/// belong to the bus itself and are never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusAddress(u8);

impl BusAddress {
    /// Sentinel: not yet resolved
    pub const UNRESOLVED: BusAddress = BusAddress(0xFF);

    /// Highest address of the reserved/system range
    pub const LAST_RESERVED: BusAddress = BusAddress(9);

    /// Create an address from its raw value
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether this is the unresolved sentinel
    pub const fn is_unresolved(self) -> bool {
        self.0 == Self::UNRESOLVED.0
    }
}

impl Default for BusAddress {
    fn default() -> Self {
        Self::UNRESOLVED
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unresolved() {
            write!(f, "unresolved")
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

impl From<u8> for BusAddress {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_sentinel() {
        assert!(DeviceId::UNBOUND.is_unbound());
        assert!(!DeviceId::new(0).is_unbound());
        assert_eq!(DeviceId::UNBOUND.to_string(), "unbound");
        assert_eq!(DeviceId::new(42).to_string(), "42");
    }

    #[test]
    fn test_device_id_next_stops_before_sentinel() {
        assert_eq!(DeviceId::new(4).next(), Some(DeviceId::new(5)));
        assert_eq!(DeviceId::new(0xFFFE).next(), None);
        assert_eq!(DeviceId::UNBOUND.next(), None);
    }

    #[test]
    fn test_bus_address() {
        assert!(BusAddress::default().is_unresolved());
        assert_eq!(BusAddress::new(10).to_string(), "0x0a");
        assert_eq!(BusAddress::UNRESOLVED.to_string(), "unresolved");
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&DeviceId::new(7)).unwrap();
        assert_eq!(json, "7");
        let addr: BusAddress = serde_json::from_str("12").unwrap();
        assert_eq!(addr, BusAddress::new(12));
    }
}
