/*!
 * Retrying transfer channel.
 *
 * Every peripheral command goes through [`BusContext::transfer`]. A failed
 * exchange is retried after pushing the handle's address back to the device,
 * which recovers devices that were power-cycled and lost it. When every
 * attempt fails the handle is marked disconnected and later calls fail
 * immediately until a sweep or a resolution brings it back.
 */
use tracing::{debug, trace, warn};

use modulo_core::clock::Clock;
use modulo_core::logging;

use crate::context::BusContext;
use crate::device::{ConnectionState, DeviceError, Result};
use crate::protocol::BusTransport;
use crate::registry::HandleKey;

impl<T: BusTransport, C: Clock> BusContext<T, C> {
    /// Exchange one command with the handle's device, using the configured attempts
    pub fn transfer(
        &mut self,
        key: HandleKey,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
    ) -> Result<()> {
        let attempts = self.settings.transfer_attempts;
        self.transfer_with_attempts(key, command, send, receive, attempts)
    }

    /// Exchange one command with the handle's device, making at most `attempts` bus calls
    pub fn transfer_with_attempts(
        &mut self,
        key: HandleKey,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
        attempts: u8,
    ) -> Result<()> {
        let handle = self.handle_mut(key)?;
        if handle.state() == ConnectionState::Disconnected {
            return Err(DeviceError::Disconnected);
        }
        let device_id = handle.device_id().to_string();
        let span = logging::component_span(handle.device_type(), Some(device_id.as_str()));
        let _enter = span.enter();

        for attempt in 1..=attempts {
            let address = match self.resolve(key) {
                Ok(address) => address,
                Err(DeviceError::UnknownHandle) => return Err(DeviceError::UnknownHandle),
                Err(e) => {
                    trace!(attempt, error = %e, "Could not resolve address");
                    continue;
                }
            };

            match self.transport.transfer(address, command, send, receive) {
                Ok(()) => {
                    self.handle_mut(key)?.mark_connected();
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, %address, command, error = %e, "Transfer failed");
                }
            }

            // The device may have been power-cycled and forgotten its address
            let device_id = self.handle_mut(key)?.device_id();
            if let Err(e) = self.transport.set_address(device_id, address) {
                trace!(%device_id, error = %e, "Address re-push failed");
            }
        }

        let handle = self.handle_mut(key)?;
        warn!(
            device_type = handle.device_type(),
            device_id = %handle.device_id(),
            attempts,
            "Module disconnected"
        );
        handle.mark_disconnected();
        Err(DeviceError::TransferFailed { attempts })
    }

    /// Single bus exchange on an already-resolved handle, without retry or
    /// connection bookkeeping. Used by driver setup hooks that run in the
    /// middle of a resolution.
    pub(crate) fn exchange(
        &mut self,
        key: HandleKey,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
    ) -> Result<()> {
        let address = self.handle_mut(key)?.address();
        if address.is_unresolved() {
            return Err(DeviceError::Disconnected);
        }
        self.transport.transfer(address, command, send, receive)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use modulo_core::clock::ManualClock;
    use modulo_core::types::{BusAddress, DeviceId};

    use super::*;
    use crate::context::BusSettings;
    use crate::devices::Driver;
    use crate::protocols::simulated::{BusOp, SimulatedBus};

    fn setup() -> (SimulatedBus, BusContext<SimulatedBus, ManualClock>, HandleKey) {
        let bus = SimulatedBus::new();
        bus.add_device(1, "co.modulo.io");
        let mut ctx = BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default());
        let key = ctx.attach("co.modulo.io", Driver::Generic);
        (bus, ctx, key)
    }

    #[test]
    fn test_first_transfer_resolves_and_connects() {
        let (bus, mut ctx, key) = setup();
        bus.set_response(DeviceId::new(1), 7, &[0xAB]);

        let mut receive = [0u8; 1];
        ctx.transfer(key, 7, &[1], &mut receive).unwrap();

        assert_eq!(receive, [0xAB]);
        let handle = ctx.handle(key).unwrap();
        assert!(handle.is_connected());
        assert_eq!(handle.address(), BusAddress::new(10));
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let (bus, mut ctx, key) = setup();
        bus.fail_transfers(DeviceId::new(1), 2);

        ctx.transfer(key, 3, &[], &mut []).unwrap();

        assert_eq!(bus.count(|op| matches!(op, BusOp::Transfer { .. })), 3);
        assert!(ctx.handle(key).unwrap().is_connected());
    }

    #[test]
    fn test_unresolvable_handle_never_reaches_bus_transfer() {
        let bus = SimulatedBus::new();
        let mut ctx = BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default());
        let key = ctx.attach("co.modulo.knob", Driver::Generic);

        let result = ctx.transfer_with_attempts(key, 0, &[], &mut [], 4);

        assert!(matches!(result, Err(DeviceError::TransferFailed { attempts: 4 })));
        assert_eq!(bus.count(|op| matches!(op, BusOp::Transfer { .. })), 0);
        assert_eq!(
            ctx.handle(key).unwrap().state(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_unknown_handle() {
        let (_bus, mut ctx, key) = setup();
        ctx.detach(key);
        assert!(matches!(
            ctx.transfer(key, 0, &[], &mut []),
            Err(DeviceError::UnknownHandle)
        ));
    }
}
