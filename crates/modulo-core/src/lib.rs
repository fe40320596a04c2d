/*!
 * Modulo Core
 *
 * This crate provides the ambient pieces shared by the Modulo crates:
 * error types, configuration, logging setup, bus identifier types and the
 * host timing primitives.
 */

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tracing;
}

/// Modulo core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with default logging
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Modulo Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
