/*!
 * Peripheral drivers for Modulo.
 *
 * Drivers are a closed set. Each variant of [`Driver`] says how it handles
 * device events and what it does when its handle obtains an address; the
 * variants that need neither say so explicitly.
 */
use tracing::debug;

use modulo_core::clock::Clock;

use crate::context::BusContext;
use crate::protocol::BusTransport;
use crate::registry::HandleKey;

pub mod display;
pub mod io;
pub mod knob;

pub use display::{Color, DisplayModule, DisplayState, TextAlignment};
pub use io::{AnalogReference, IoModule};
pub use knob::{KnobCallback, KnobModule, KnobSnapshot, KnobState};

/// Driver-specific state carried by a module handle
#[derive(Debug)]
pub enum Driver {
    /// Plain handle with no command vocabulary of its own
    Generic,
    /// Digital/analog I/O board
    Io,
    /// Illuminated rotary knob with push button
    Knob(KnobState),
    /// Small color display with three buttons
    Display(DisplayState),
}

impl Driver {
    /// Interpret an event raised by the device
    ///
    /// Returns whether the event code meant anything to this driver.
    pub fn process_event(&mut self, code: u8, data: u16) -> bool {
        match self {
            Driver::Generic => false,
            Driver::Io => false,
            Driver::Knob(state) => state.process_event(code, data),
            Driver::Display(_) => false,
        }
    }

    /// The variant without its state
    pub fn kind(&self) -> DriverKind {
        match self {
            Driver::Generic => DriverKind::Generic,
            Driver::Io => DriverKind::Io,
            Driver::Knob(_) => DriverKind::Knob,
            Driver::Display(_) => DriverKind::Display,
        }
    }
}

/// Stateless tag of a [`Driver`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// See [`Driver::Generic`]
    Generic,
    /// See [`Driver::Io`]
    Io,
    /// See [`Driver::Knob`]
    Knob,
    /// See [`Driver::Display`]
    Display,
}

/// Driver setup after a handle obtains an address
///
/// Failures here are logged and otherwise ignored; the handle's own
/// transfers surface any lasting problem.
pub(crate) fn on_resolved<T: BusTransport, C: Clock>(ctx: &mut BusContext<T, C>, key: HandleKey) {
    let kind = match ctx.handle(key) {
        Some(handle) => handle.driver().kind(),
        None => return,
    };

    let result = match kind {
        DriverKind::Generic => Ok(()),
        DriverKind::Io => io::on_resolved(ctx, key),
        DriverKind::Knob => knob::on_resolved(ctx, key),
        DriverKind::Display => display::on_resolved(ctx, key),
    };

    if let Err(e) = result {
        debug!(driver = ?kind, error = %e, "Driver setup after resolution failed");
    }
}
