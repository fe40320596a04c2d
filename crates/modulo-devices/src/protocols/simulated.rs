/*!
 * In-memory bus for tests and the host demo.
 *
 * [`SimulatedBus`] keeps a table of devices (id, type, persisted address,
 * online flag) and answers the [`BusTransport`] calls from it. Failures and
 * responses can be scripted per device, events can be queued, and every call
 * is appended to an operation log so tests can count attempts. With a
 * clock attached, each logged call is also stamped with the clock's time.
 *
 * Clones share the same state, so a test keeps one clone for scripting and
 * inspection while the bus context owns the other.
 */
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use modulo_core::clock::Clock;
use modulo_core::error::{Error as CoreError, Result as CoreResult};
use modulo_core::types::{BusAddress, DeviceId};

use crate::protocol::{BusEvent, BusTransport, TransportError, TransportResult};

/// One recorded bus call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// [`BusTransport::setup`]
    Setup,
    /// [`BusTransport::global_reset`]
    GlobalReset,
    /// [`BusTransport::next_device_id`] with its lower bound
    NextDeviceId(DeviceId),
    /// [`BusTransport::device_type`]
    DeviceType(DeviceId),
    /// [`BusTransport::get_address`]
    GetAddress(DeviceId),
    /// [`BusTransport::set_address`]
    SetAddress(DeviceId, BusAddress),
    /// [`BusTransport::transfer`]
    Transfer {
        /// Target address
        address: BusAddress,
        /// Command code
        command: u8,
        /// Bytes sent with the command
        sent: Vec<u8>,
    },
    /// [`BusTransport::next_event`]
    NextEvent,
}

#[derive(Debug, Default)]
struct SimDevice {
    device_type: String,
    address: Option<BusAddress>,
    online: bool,
    transfer_failures: u32,
    always_fail: bool,
    responses: HashMap<u8, Vec<u8>>,
    queued: HashMap<u8, VecDeque<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct SimState {
    devices: BTreeMap<DeviceId, SimDevice>,
    setup_failures: u32,
    events: VecDeque<BusEvent>,
    ops: Vec<BusOp>,
    stamps: Vec<Duration>,
    clock: Option<Box<dyn Clock>>,
}

impl SimState {
    fn online(&mut self, device_id: DeviceId) -> TransportResult<&mut SimDevice> {
        self.devices
            .get_mut(&device_id)
            .filter(|device| device.online)
            .ok_or(TransportError::DeviceNotPresent { device_id })
    }
}

/// Scriptable in-memory [`BusTransport`]
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp every recorded call with `clock`'s elapsed time
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.state.borrow_mut().clock = Some(Box::new(clock));
        self
    }

    /// Build a bus from a topology description
    pub fn from_topology(topology: &Topology) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.state.borrow_mut();
            for device in &topology.devices {
                let responses = device
                    .responses
                    .iter()
                    .map(|r| (r.command, r.data.clone()))
                    .collect();
                state.devices.insert(
                    device.device_id,
                    SimDevice {
                        device_type: device.device_type.clone(),
                        address: device.address,
                        online: device.online,
                        responses,
                        ..SimDevice::default()
                    },
                );
            }
            state.events.extend(topology.events.iter().copied());
        }
        bus
    }

    /// Attach an online device with no address
    pub fn add_device(&self, device_id: u16, device_type: &str) {
        self.state.borrow_mut().devices.insert(
            DeviceId::new(device_id),
            SimDevice {
                device_type: device_type.to_string(),
                online: true,
                ..SimDevice::default()
            },
        );
    }

    /// Remove a device from the bus entirely
    pub fn remove_device(&self, device_id: DeviceId) {
        self.state.borrow_mut().devices.remove(&device_id);
    }

    /// Overwrite the address persisted on a device, bypassing the log
    pub fn force_address(&self, device_id: DeviceId, address: BusAddress) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.address = Some(address);
        }
    }

    /// The address currently persisted on a device
    pub fn device_address(&self, device_id: DeviceId) -> Option<BusAddress> {
        self.state
            .borrow()
            .devices
            .get(&device_id)
            .and_then(|device| device.address)
    }

    /// Unplug (`false`) or replug (`true`) a device; it keeps its address
    pub fn set_online(&self, device_id: DeviceId, online: bool) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.online = online;
        }
    }

    /// Simulate a power cycle: the device stays present but forgets its address
    pub fn power_cycle(&self, device_id: DeviceId) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.address = None;
        }
    }

    /// Make the next `count` setup calls fail
    pub fn fail_setup(&self, count: u32) {
        self.state.borrow_mut().setup_failures = count;
    }

    /// Make the next `count` transfers to a device fail
    pub fn fail_transfers(&self, device_id: DeviceId, count: u32) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.transfer_failures = count;
        }
    }

    /// Make every transfer to a device fail until turned off again
    pub fn set_always_fail(&self, device_id: DeviceId, fail: bool) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.always_fail = fail;
        }
    }

    /// Standing response for a command; unscripted commands answer zeros
    pub fn set_response(&self, device_id: DeviceId, command: u8, data: &[u8]) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device.responses.insert(command, data.to_vec());
        }
    }

    /// One-shot response, used before any standing response
    pub fn queue_response(&self, device_id: DeviceId, command: u8, data: &[u8]) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(&device_id) {
            device
                .queued
                .entry(command)
                .or_default()
                .push_back(data.to_vec());
        }
    }

    /// Queue an event for [`BusTransport::next_event`]
    pub fn push_event(&self, device_id: DeviceId, code: u8, data: u16) {
        self.state.borrow_mut().events.push_back(BusEvent {
            device_id,
            code,
            data,
        });
    }

    /// Every bus call so far, oldest first
    pub fn ops(&self) -> Vec<BusOp> {
        self.state.borrow().ops.clone()
    }

    /// Forget the recorded bus calls
    pub fn clear_ops(&self) {
        let mut state = self.state.borrow_mut();
        state.ops.clear();
        state.stamps.clear();
    }

    /// Number of recorded bus calls matching `predicate`
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&BusOp) -> bool,
    {
        self.state.borrow().ops.iter().filter(|op| predicate(op)).count()
    }

    /// Clock time of the first recorded call matching `predicate`
    ///
    /// Calls recorded without a clock are stamped at zero.
    pub fn time_of<F>(&self, predicate: F) -> Option<Duration>
    where
        F: Fn(&BusOp) -> bool,
    {
        let state = self.state.borrow();
        state
            .ops
            .iter()
            .position(|op| predicate(op))
            .and_then(|index| state.stamps.get(index).copied())
    }

    fn record(&self, op: BusOp) -> std::cell::RefMut<'_, SimState> {
        trace!(?op, "Simulated bus call");
        let mut state = self.state.borrow_mut();
        let stamp = state
            .clock
            .as_ref()
            .map_or(Duration::ZERO, |clock| clock.elapsed());
        state.ops.push(op);
        state.stamps.push(stamp);
        state
    }
}

impl BusTransport for SimulatedBus {
    fn setup(&mut self) -> TransportResult<()> {
        let mut state = self.record(BusOp::Setup);
        if state.setup_failures > 0 {
            state.setup_failures -= 1;
            return Err(TransportError::Io("simulated setup failure".to_string()));
        }
        Ok(())
    }

    fn global_reset(&mut self) -> TransportResult<()> {
        let mut state = self.record(BusOp::GlobalReset);
        for device in state.devices.values_mut().filter(|d| d.online) {
            device.address = None;
        }
        Ok(())
    }

    fn next_device_id(&mut self, after: DeviceId) -> Option<DeviceId> {
        let state = self.record(BusOp::NextDeviceId(after));
        let found = state
            .devices
            .range(after..)
            .find(|(_, device)| device.online)
            .map(|(id, _)| *id);
        found
    }

    fn device_type(&mut self, device_id: DeviceId, max_len: usize) -> TransportResult<String> {
        let mut state = self.record(BusOp::DeviceType(device_id));
        let device = state.online(device_id)?;
        let mut device_type = device.device_type.clone();
        if device_type.len() > max_len {
            let mut end = max_len;
            while !device_type.is_char_boundary(end) {
                end -= 1;
            }
            device_type.truncate(end);
        }
        Ok(device_type)
    }

    fn get_address(&mut self, device_id: DeviceId) -> TransportResult<Option<BusAddress>> {
        let mut state = self.record(BusOp::GetAddress(device_id));
        Ok(state.online(device_id)?.address)
    }

    fn set_address(&mut self, device_id: DeviceId, address: BusAddress) -> TransportResult<()> {
        let mut state = self.record(BusOp::SetAddress(device_id, address));
        state.online(device_id)?.address = Some(address);
        Ok(())
    }

    fn transfer(
        &mut self,
        address: BusAddress,
        command: u8,
        send: &[u8],
        receive: &mut [u8],
    ) -> TransportResult<()> {
        let mut state = self.record(BusOp::Transfer {
            address,
            command,
            sent: send.to_vec(),
        });
        let device = state
            .devices
            .values_mut()
            .find(|device| device.online && device.address == Some(address))
            .ok_or(TransportError::NoAcknowledge { address })?;

        if device.always_fail {
            return Err(TransportError::Timeout);
        }
        if device.transfer_failures > 0 {
            device.transfer_failures -= 1;
            return Err(TransportError::Timeout);
        }

        let queued = device.queued.get_mut(&command).and_then(VecDeque::pop_front);
        let response = queued
            .or_else(|| device.responses.get(&command).cloned())
            .unwrap_or_default();

        receive.fill(0);
        let len = response.len().min(receive.len());
        receive[..len].copy_from_slice(&response[..len]);
        Ok(())
    }

    fn next_event(&mut self) -> Option<BusEvent> {
        let mut state = self.record(BusOp::NextEvent);
        state.events.pop_front()
    }
}

/// A command response scripted in a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedResponse {
    /// Command code
    pub command: u8,
    /// Bytes returned
    pub data: Vec<u8>,
}

/// A device described in a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    /// Logical identifier
    pub device_id: DeviceId,
    /// Declared type string
    pub device_type: String,
    /// Address already persisted on the device
    #[serde(default)]
    pub address: Option<BusAddress>,
    /// Whether the device answers
    #[serde(default = "default_online")]
    pub online: bool,
    /// Standing command responses
    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
}

fn default_online() -> bool {
    true
}

/// Devices and initial events of a simulated bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Attached devices
    #[serde(default)]
    pub devices: Vec<SimulatedDevice>,
    /// Events pending at startup
    #[serde(default)]
    pub events: Vec<BusEvent>,
}

impl Topology {
    /// Parse a TOML topology
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse a JSON topology
    pub fn from_json_str(s: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a topology file; `.json` files are JSON, anything else TOML
    pub fn load<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let topology = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)?,
        };

        let mut seen = std::collections::HashSet::new();
        for device in &topology.devices {
            if device.device_id.is_unbound() {
                return Err(CoreError::validation(format!(
                    "device id {} is reserved",
                    device.device_id.raw()
                )));
            }
            if !seen.insert(device.device_id) {
                return Err(CoreError::validation(format!(
                    "device id {} listed twice",
                    device.device_id
                )));
            }
        }
        Ok(topology)
    }
}
