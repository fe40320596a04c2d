/*!
 * Modulo Devices
 *
 * This crate implements the host side of the Modulo peripheral bus: the
 * process-wide bus context, the registry of module handles, lazy address
 * resolution, the retrying transfer channel and the peripheral drivers.
 */

#![warn(missing_docs)]

// Re-export core types
pub use modulo_core::prelude;

pub mod channel;
pub mod context;
pub mod device;
pub mod devices;
pub mod discovery;
pub mod protocol;
pub mod protocols;
pub mod registry;

pub use context::{BusContext, BusSettings, DiscoveredDevice, TickReport};
pub use device::{ConnectionState, DeviceError, ModuleHandle};
pub use devices::{Color, DisplayModule, Driver, DriverKind, IoModule, KnobModule, TextAlignment};
pub use protocol::{BusEvent, BusTransport, TransportError};
pub use registry::{DeviceRegistry, HandleKey};

/// Modulo devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
