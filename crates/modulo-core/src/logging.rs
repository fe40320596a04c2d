/*!
 * Logging functionality for Modulo.
 *
 * This module provides tracing setup and span helpers. The library crates
 * only emit `tracing` events; nothing is printed until a host calls one of
 * the `init` functions here.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "modulo_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    if !config.json_format {
        return init_with_filter(&config.level);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(fmt::layer().json().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::debug_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Only the first global subscriber wins; later calls report an error
        let _ = init();
        assert!(init().is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("bus", Some("3"));
        assert!(span.is_none() || span.id().is_some());

        let span = component_span("bus", None);
        assert!(span.is_none() || span.id().is_some());
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("sweep", "bus");
        assert!(span.is_none() || span.id().is_some());
    }
}
