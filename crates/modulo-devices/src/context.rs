/*!
 * Bus context for Modulo.
 *
 * A [`BusContext`] is created once at startup and owns everything that is
 * process-wide on the bus: the transport, the host clock, the registry of
 * live handles, the "bus initialized" flag and the address counter. Every
 * module driver works through it by [`HandleKey`].
 *
 * Address resolution lives in [`crate::discovery`] and the retrying
 * transfer channel in [`crate::channel`]; both are `impl` blocks on this
 * type.
 */
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use modulo_core::clock::{Clock, SystemClock};
use modulo_core::config::BusConfig;
use modulo_core::logging;
use modulo_core::types::{BusAddress, DeviceId};

use crate::device::{ConnectionState, DeviceError, ModuleHandle, Result};
use crate::devices::Driver;
use crate::protocol::BusTransport;
use crate::registry::{DeviceRegistry, HandleKey};

/// Tunables of the bus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Minimum process uptime before the first bus call
    pub warmup: Duration,
    /// Address counter seed; the first synthesized address is `seed + 1`
    pub address_seed: u8,
    /// Attempts made by [`BusContext::transfer`]
    pub transfer_attempts: u8,
    /// Longest device type string read from a device
    pub device_type_max_len: usize,
    /// Events drained per [`BusContext::process_events`] call
    pub event_poll_limit: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for BusSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            warmup: Duration::from_millis(config.warmup_ms),
            address_seed: config.address_seed,
            transfer_attempts: config.transfer_attempts.max(1),
            device_type_max_len: config.device_type_max_len,
            event_poll_limit: config.event_poll_limit,
        }
    }
}

/// A device seen during a bus enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Logical identifier
    pub device_id: DeviceId,
    /// Declared type string, if the device answered
    pub device_type: Option<String>,
    /// Persisted address, if one has been assigned
    pub address: Option<BusAddress>,
    /// Whether a registered handle is bound to this device
    pub claimed: bool,
}

/// Outcome of one host main loop iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Handles that became connected during the sweep
    pub connected: usize,
    /// Events routed to a handle
    pub events: usize,
}

/// Process-wide bus state and the entry point for every module operation
#[derive(Debug)]
pub struct BusContext<T: BusTransport, C: Clock = SystemClock> {
    pub(crate) transport: T,
    pub(crate) clock: C,
    pub(crate) settings: BusSettings,
    pub(crate) registry: DeviceRegistry,
    pub(crate) initialized: bool,
    pub(crate) last_assigned: u8,
}

impl<T: BusTransport, C: Clock> BusContext<T, C> {
    /// Create a new bus context
    pub fn new(transport: T, clock: C, settings: BusSettings) -> Self {
        Self {
            transport,
            clock,
            last_assigned: settings.address_seed,
            settings,
            registry: DeviceRegistry::new(),
            initialized: false,
        }
    }

    /// Create a bus context from the `[bus]` configuration section
    pub fn from_config(transport: T, clock: C, config: &BusConfig) -> Self {
        Self::new(transport, clock, BusSettings::from(config))
    }

    /// The bus transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The host clock
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Protocol tunables
    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// The registry of live handles
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Whether the one-time global bus initialization has run
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Most recently synthesized address
    pub fn last_assigned_address(&self) -> BusAddress {
        BusAddress::new(self.last_assigned)
    }

    /// Register a handle that binds to the first unclaimed device of its type
    pub fn attach(&mut self, device_type: &str, driver: Driver) -> HandleKey {
        debug!(device_type, "Attaching module by type");
        self.registry.register(ModuleHandle::new(device_type, driver))
    }

    /// Register a handle bound to a specific device
    ///
    /// Fails if another live handle is already bound to `device_id`.
    pub fn attach_device(
        &mut self,
        device_type: &str,
        device_id: DeviceId,
        driver: Driver,
    ) -> Result<HandleKey> {
        if device_id.is_unbound() {
            return Ok(self.attach(device_type, driver));
        }
        if self.registry.find_by_device_id(device_id).is_some() {
            return Err(DeviceError::AlreadyClaimed { device_id });
        }

        debug!(device_type, %device_id, "Attaching module by device id");
        Ok(self
            .registry
            .register(ModuleHandle::with_device_id(device_type, device_id, driver)))
    }

    /// Remove a handle from the registry
    pub fn detach(&mut self, key: HandleKey) -> Option<ModuleHandle> {
        self.registry.unregister(key)
    }

    /// Look up a handle
    pub fn handle(&self, key: HandleKey) -> Option<&ModuleHandle> {
        self.registry.get(key)
    }

    pub(crate) fn handle_mut(&mut self, key: HandleKey) -> Result<&mut ModuleHandle> {
        self.registry.get_mut(key).ok_or(DeviceError::UnknownHandle)
    }

    /// The handle's bus address, resolving it first if needed
    pub fn address(&mut self, key: HandleKey) -> Result<BusAddress> {
        self.resolve(key)
    }

    /// The handle's logical device, resolving it first if needed
    pub fn device_id(&mut self, key: HandleKey) -> Result<DeviceId> {
        self.resolve(key)?;
        Ok(self.handle_mut(key)?.device_id())
    }

    /// Housekeeping sweep: try to resolve every handle that is not connected
    ///
    /// Returns the number of handles that became connected.
    pub fn sweep(&mut self) -> usize {
        let span = logging::operation_span("sweep", "bus");
        let _enter = span.enter();
        trace!(handles = self.registry.len(), "Sweeping");

        let mut connected = 0;
        for key in self.registry.keys() {
            let state = match self.registry.get(key) {
                Some(handle) => handle.state(),
                None => continue,
            };
            if state == ConnectionState::Connected {
                continue;
            }

            match self.resolve(key) {
                Ok(address) => {
                    if let Some(handle) = self.registry.get_mut(key) {
                        handle.mark_connected();
                        info!(
                            device_type = handle.device_type(),
                            device_id = %handle.device_id(),
                            %address,
                            "Module connected"
                        );
                        connected += 1;
                    }
                }
                Err(e) => {
                    trace!(?key, error = %e, "Module still unreachable");
                }
            }
        }
        connected
    }

    /// Drain pending device events and route each to its handle
    ///
    /// Returns the number of events delivered to a handle.
    pub fn process_events(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..self.settings.event_poll_limit {
            let event = match self.transport.next_event() {
                Some(event) => event,
                None => break,
            };

            let key = if event.device_id.is_unbound() {
                None
            } else {
                self.registry.find_by_device_id(event.device_id)
            };

            match key {
                Some(key) => {
                    if self.dispatch_event(key, event.code, event.data).is_ok() {
                        delivered += 1;
                    }
                }
                None => {
                    debug!(device_id = %event.device_id, code = event.code, "Dropping event for unknown device");
                }
            }
        }
        delivered
    }

    /// Hand an event to the handle's driver
    ///
    /// Returns whether the driver recognized the event code.
    pub fn dispatch_event(&mut self, key: HandleKey, code: u8, data: u16) -> Result<bool> {
        let handle = self.handle_mut(key)?;
        let handled = handle.driver.process_event(code, data);
        trace!(
            device_id = %handle.device_id(),
            code,
            data,
            handled,
            "Dispatched event"
        );
        Ok(handled)
    }

    /// One host main loop iteration: housekeeping sweep, then events
    pub fn tick(&mut self) -> TickReport {
        TickReport {
            connected: self.sweep(),
            events: self.process_events(),
        }
    }

    /// Walk the bus and report every present device
    ///
    /// Runs the global initialization first if it has not happened yet.
    pub fn enumerate(&mut self) -> Result<Vec<DiscoveredDevice>> {
        self.ensure_initialized()?;

        let mut devices = Vec::new();
        let mut cursor = self.transport.next_device_id(DeviceId::new(0));
        while let Some(device_id) = cursor {
            let device_type = self
                .transport
                .device_type(device_id, self.settings.device_type_max_len)
                .ok();
            let address = self.transport.get_address(device_id).ok().flatten();
            devices.push(DiscoveredDevice {
                device_id,
                device_type,
                address,
                claimed: self.registry.find_by_device_id(device_id).is_some(),
            });
            cursor = device_id
                .next()
                .and_then(|next| self.transport.next_device_id(next));
        }
        Ok(devices)
    }
}
