/*!
 * Bus transport implementations for Modulo.
 *
 * Hardware transports live with the host board support; this crate ships
 * the in-memory bus used by the tests and the host demo.
 */

pub mod simulated;

pub use simulated::{BusOp, ScriptedResponse, SimulatedBus, SimulatedDevice, Topology};
