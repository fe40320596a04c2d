/*!
 * Address resolution for Modulo.
 *
 * Before any transfer a handle needs a bus address. Getting one takes up to
 * three steps, each done only when needed:
 *
 * 1. the one-time global bus initialization (warm-up wait, setup, reset),
 * 2. for wildcard handles, a scan for the first unclaimed device of the
 *    handle's type, in ascending id order,
 * 3. reading the device's persisted address, or assigning a fresh one from
 *    the context's counter and writing it back.
 *
 * Addresses persist on the devices themselves, so re-resolving a handle
 * after a transient disconnect normally yields the same address again.
 */
use tracing::{debug, info, trace};

use modulo_core::clock::Clock;
use modulo_core::types::{BusAddress, DeviceId};

use crate::context::BusContext;
use crate::device::{DeviceError, Result};
use crate::devices;
use crate::protocol::BusTransport;
use crate::registry::HandleKey;

impl<T: BusTransport, C: Clock> BusContext<T, C> {
    /// Run the global bus initialization if it has not run yet
    ///
    /// Waits until the configured warm-up has elapsed since process start so
    /// attached devices have booted, then sets the bus up and broadcasts a
    /// global reset. Completes at most once per context.
    pub fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let elapsed = self.clock.elapsed();
        if elapsed < self.settings.warmup {
            let wait = self.settings.warmup - elapsed;
            debug!(?wait, "Waiting for devices to boot");
            self.clock.sleep(wait);
        }

        self.transport.setup()?;
        self.transport.global_reset()?;
        self.registry.for_each(|_, handle| handle.reset());
        self.initialized = true;

        info!("Bus initialized");
        Ok(())
    }

    /// Broadcast a global reset again, forgetting every assigned address
    ///
    /// Handles re-resolve lazily on their next use.
    pub fn reset_bus(&mut self) -> Result<()> {
        if !self.initialized {
            return self.ensure_initialized();
        }
        self.transport.global_reset()?;
        self.registry.for_each(|_, handle| handle.reset());
        debug!("Bus reset, all handles unresolved");
        Ok(())
    }

    /// Make sure the handle has a usable address and return it
    pub(crate) fn resolve(&mut self, key: HandleKey) -> Result<BusAddress> {
        let (device_type, mut device_id, address) = {
            let handle = self.handle_mut(key)?;
            (
                handle.device_type().to_string(),
                handle.device_id(),
                handle.address(),
            )
        };
        if !address.is_unresolved() {
            return Ok(address);
        }

        self.ensure_initialized()?;

        if device_id.is_unbound() {
            device_id = self.discover(key, &device_type)?;
            self.handle_mut(key)?.bind(device_id);
            debug!(%device_id, device_type = %device_type, "Bound module to device");
        }

        let address = match self.transport.get_address(device_id) {
            Ok(Some(address)) if !address.is_unresolved() => address,
            Ok(_) => {
                let address = self.allocate_address()?;
                self.transport
                    .set_address(device_id, address)
                    .map_err(|source| DeviceError::Unreachable { device_id, source })?;
                debug!(%device_id, %address, "Assigned new address");
                address
            }
            Err(source) => return Err(DeviceError::Unreachable { device_id, source }),
        };

        self.handle_mut(key)?.set_address(address);
        trace!(%device_id, %address, "Resolved module address");

        devices::on_resolved(self, key);
        Ok(address)
    }

    /// Scan the bus for the first unclaimed device of `device_type`
    fn discover(&mut self, key: HandleKey, device_type: &str) -> Result<DeviceId> {
        let mut cursor = self.transport.next_device_id(DeviceId::new(0));

        while let Some(device_id) = cursor {
            if self.registry.is_claimed_by_other(device_id, key) {
                trace!(%device_id, "Skipping claimed device");
            } else {
                match self
                    .transport
                    .device_type(device_id, self.settings.device_type_max_len)
                {
                    Ok(found) if found == device_type => return Ok(device_id),
                    Ok(found) => trace!(%device_id, found = %found, "Type mismatch"),
                    Err(e) => debug!(%device_id, error = %e, "Could not read device type"),
                }
            }

            cursor = device_id
                .next()
                .and_then(|next| self.transport.next_device_id(next));
        }

        Err(DeviceError::NoMatchingDevice {
            device_type: device_type.to_string(),
        })
    }

    /// Take the next address from the counter
    fn allocate_address(&mut self) -> Result<BusAddress> {
        let next = self
            .last_assigned
            .checked_add(1)
            .filter(|raw| *raw != BusAddress::UNRESOLVED.raw())
            .ok_or(DeviceError::AddressSpaceExhausted)?;
        self.last_assigned = next;
        Ok(BusAddress::new(next))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use modulo_core::clock::ManualClock;

    use super::*;
    use crate::context::BusSettings;
    use crate::devices::Driver;
    use crate::protocols::simulated::{BusOp, SimulatedBus};

    fn context(bus: &SimulatedBus) -> BusContext<SimulatedBus, ManualClock> {
        BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default())
    }

    #[test]
    fn test_allocation_starts_above_reserved_range() {
        let bus = SimulatedBus::new();
        let mut ctx = context(&bus);
        assert_eq!(ctx.allocate_address().unwrap(), BusAddress::new(10));
        assert_eq!(ctx.allocate_address().unwrap(), BusAddress::new(11));
    }

    #[test]
    fn test_allocation_never_hands_out_sentinel() {
        let bus = SimulatedBus::new();
        let mut settings = BusSettings::default();
        settings.address_seed = 0xFD;
        let mut ctx = BusContext::new(bus, ManualClock::new(), settings);

        assert_eq!(ctx.allocate_address().unwrap(), BusAddress::new(0xFE));
        assert!(matches!(
            ctx.allocate_address(),
            Err(DeviceError::AddressSpaceExhausted)
        ));
    }

    #[test]
    fn test_existing_address_is_accepted() {
        let bus = SimulatedBus::new();
        bus.add_device(3, "co.modulo.io");
        let mut ctx = context(&bus);
        ctx.ensure_initialized().unwrap();
        bus.force_address(DeviceId::new(3), BusAddress::new(42));

        let key = ctx.attach("co.modulo.io", Driver::Generic);
        assert_eq!(ctx.address(key).unwrap(), BusAddress::new(42));
        assert_eq!(ctx.last_assigned_address(), BusAddress::new(9));
        assert_eq!(bus.count(|op| matches!(op, BusOp::SetAddress(..))), 0);
    }

    #[test]
    fn test_setup_failure_is_retried() {
        let bus = SimulatedBus::new();
        bus.fail_setup(1);
        let mut ctx = context(&bus);

        assert!(ctx.ensure_initialized().is_err());
        assert!(!ctx.is_initialized());
        assert!(ctx.ensure_initialized().is_ok());
        assert!(ctx.is_initialized());
        assert_eq!(ctx.clock().sleeps(), vec![Duration::from_millis(100)]);
    }
}
