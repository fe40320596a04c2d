/*!
 * Prelude module for Modulo Core.
 *
 * This module re-exports commonly used types and functions from the Modulo Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export bus identifier types
pub use crate::types::{BusAddress, DeviceId};

// Re-export timing primitives
pub use crate::clock::{Clock, ManualClock, SystemClock};

// Re-export config types
pub use crate::config::{BusConfig, Config, ConfigBuilder, HostConfig};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
