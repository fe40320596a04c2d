/*!
 * Illuminated knob driver.
 *
 * A rotary encoder (24 clicks per revolution) with a push button and an RGB
 * LED. The knob raises events when the button changes or the knob turns;
 * [`BusContext::process_events`] routes them here, the cached state is
 * updated and the matching callback runs.
 */
use std::fmt;

use modulo_core::clock::Clock;
use modulo_core::types::DeviceId;

use crate::context::BusContext;
use crate::device::{DeviceError, Result};
use crate::devices::Driver;
use crate::protocol::BusTransport;
use crate::registry::HandleKey;

/// Device type string declared by knobs
pub const DEVICE_TYPE: &str = "co.modulo.knob";

/// Encoder clicks per full revolution
pub const CLICKS_PER_REVOLUTION: i16 = 24;

mod command {
    pub const SET_COLOR: u8 = 0;
    pub const GET_BUTTON: u8 = 1;
    pub const GET_POSITION: u8 = 2;
}

mod event {
    pub const BUTTON_CHANGED: u8 = 0;
    pub const POSITION_CHANGED: u8 = 1;
}

/// Knob state as last reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnobSnapshot {
    /// Whether the button is held down
    pub button: bool,
    /// Position in clicks
    pub position: i16,
}

/// Callback invoked with the knob state after an event
pub type KnobCallback = Box<dyn FnMut(&KnobSnapshot)>;

/// Knob driver state kept in the module handle
#[derive(Default)]
pub struct KnobState {
    snapshot: KnobSnapshot,
    on_press: Option<KnobCallback>,
    on_release: Option<KnobCallback>,
    on_position: Option<KnobCallback>,
}

impl fmt::Debug for KnobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnobState")
            .field("snapshot", &self.snapshot)
            .field("on_press", &self.on_press.is_some())
            .field("on_release", &self.on_release.is_some())
            .field("on_position", &self.on_position.is_some())
            .finish()
    }
}

impl KnobState {
    /// Last known state
    pub fn snapshot(&self) -> KnobSnapshot {
        self.snapshot
    }

    /// Apply a knob event and run the matching callbacks
    ///
    /// Button events carry "pressed" in the high byte and "released" in the
    /// low byte; both may be set when the button bounced between polls.
    pub(crate) fn process_event(&mut self, code: u8, data: u16) -> bool {
        match code {
            event::BUTTON_CHANGED => {
                let [released, pressed] = data.to_le_bytes();
                if pressed != 0 {
                    self.snapshot.button = true;
                    let snapshot = self.snapshot;
                    if let Some(callback) = self.on_press.as_mut() {
                        callback(&snapshot);
                    }
                }
                if released != 0 {
                    self.snapshot.button = false;
                    let snapshot = self.snapshot;
                    if let Some(callback) = self.on_release.as_mut() {
                        callback(&snapshot);
                    }
                }
                true
            }
            event::POSITION_CHANGED => {
                self.snapshot.position = data as i16;
                let snapshot = self.snapshot;
                if let Some(callback) = self.on_position.as_mut() {
                    callback(&snapshot);
                }
                true
            }
            _ => false,
        }
    }
}

/// Handle to a knob
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a module stays registered until it is released"]
pub struct KnobModule {
    key: HandleKey,
}

impl KnobModule {
    /// Use the first knob not already claimed by another handle
    pub fn new<T: BusTransport, C: Clock>(ctx: &mut BusContext<T, C>) -> Self {
        Self {
            key: ctx.attach(DEVICE_TYPE, Driver::Knob(KnobState::default())),
        }
    }

    /// Use the knob with the given device id
    pub fn with_device_id<T: BusTransport, C: Clock>(
        ctx: &mut BusContext<T, C>,
        device_id: DeviceId,
    ) -> Result<Self> {
        Ok(Self {
            key: ctx.attach_device(DEVICE_TYPE, device_id, Driver::Knob(KnobState::default()))?,
        })
    }

    /// The registry key of this module
    pub fn key(&self) -> HandleKey {
        self.key
    }

    /// Remove this module from the bus context
    pub fn release<T: BusTransport, C: Clock>(self, ctx: &mut BusContext<T, C>) {
        ctx.detach(self.key);
    }

    /// Set the LED color; components are clamped to `0.0..=1.0`
    pub fn set_color<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        r: f32,
        g: f32,
        b: f32,
    ) -> Result<()> {
        let send = [channel(r), channel(g), channel(b)];
        ctx.transfer(self.key, command::SET_COLOR, &send, &mut [])
    }

    /// Set the LED color from hue (degrees), saturation and value
    pub fn set_hsv<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        h: f32,
        s: f32,
        v: f32,
    ) -> Result<()> {
        let (r, g, b) = hsv_to_rgb(h, s, v);
        self.set_color(ctx, r, g, b)
    }

    /// Whether the button is currently pressed
    pub fn button<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<bool> {
        let mut value = [0u8; 1];
        ctx.transfer(self.key, command::GET_BUTTON, &[], &mut value)?;
        let pressed = value[0] != 0;
        state_mut(ctx, self.key)?.snapshot.button = pressed;
        Ok(pressed)
    }

    /// Position in clicks
    pub fn position<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<i16> {
        let mut value = [0u8; 2];
        ctx.transfer(self.key, command::GET_POSITION, &[], &mut value)?;
        let position = i16::from_le_bytes(value);
        state_mut(ctx, self.key)?.snapshot.position = position;
        Ok(position)
    }

    /// Angle in degrees, `0..360`
    pub fn angle<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<i16> {
        let position = self.position(ctx)?;
        Ok(position.rem_euclid(CLICKS_PER_REVOLUTION) * (360 / CLICKS_PER_REVOLUTION))
    }

    /// Last state reported by the device or its events, without a bus call
    pub fn snapshot<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<KnobSnapshot> {
        Ok(state_mut(ctx, self.key)?.snapshot)
    }

    /// Run `callback` whenever the button is pressed
    pub fn on_button_press<T, C, F>(&self, ctx: &mut BusContext<T, C>, callback: F) -> Result<()>
    where
        T: BusTransport,
        C: Clock,
        F: FnMut(&KnobSnapshot) + 'static,
    {
        state_mut(ctx, self.key)?.on_press = Some(Box::new(callback));
        Ok(())
    }

    /// Run `callback` whenever the button is released
    pub fn on_button_release<T, C, F>(&self, ctx: &mut BusContext<T, C>, callback: F) -> Result<()>
    where
        T: BusTransport,
        C: Clock,
        F: FnMut(&KnobSnapshot) + 'static,
    {
        state_mut(ctx, self.key)?.on_release = Some(Box::new(callback));
        Ok(())
    }

    /// Run `callback` whenever the knob turns
    pub fn on_position_change<T, C, F>(&self, ctx: &mut BusContext<T, C>, callback: F) -> Result<()>
    where
        T: BusTransport,
        C: Clock,
        F: FnMut(&KnobSnapshot) + 'static,
    {
        state_mut(ctx, self.key)?.on_position = Some(Box::new(callback));
        Ok(())
    }
}

fn state_mut<T: BusTransport, C: Clock>(
    ctx: &mut BusContext<T, C>,
    key: HandleKey,
) -> Result<&mut KnobState> {
    match &mut ctx.handle_mut(key)?.driver {
        Driver::Knob(state) => Ok(state),
        _ => Err(DeviceError::UnknownHandle),
    }
}

fn channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Convert hue in degrees plus saturation and value in `0.0..=1.0` to RGB
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let s = s.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    if s == 0.0 {
        return (v, v, v);
    }

    let h = h.rem_euclid(360.0) / 60.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    match sector as u8 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Refresh the cached button and position once the knob has an address
pub(crate) fn on_resolved<T: BusTransport, C: Clock>(
    ctx: &mut BusContext<T, C>,
    key: HandleKey,
) -> Result<()> {
    let mut button = [0u8; 1];
    ctx.exchange(key, command::GET_BUTTON, &[], &mut button)?;
    let mut position = [0u8; 2];
    ctx.exchange(key, command::GET_POSITION, &[], &mut position)?;

    let snapshot = &mut state_mut(ctx, key)?.snapshot;
    snapshot.button = button[0] != 0;
    snapshot.position = i16::from_le_bytes(position);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use modulo_core::clock::ManualClock;

    use super::*;
    use crate::context::BusSettings;
    use crate::protocols::simulated::{BusOp, SimulatedBus};

    fn setup() -> (SimulatedBus, BusContext<SimulatedBus, ManualClock>, KnobModule) {
        let bus = SimulatedBus::new();
        bus.add_device(2, DEVICE_TYPE);
        let mut ctx = BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default());
        let knob = KnobModule::new(&mut ctx);
        (bus, ctx, knob)
    }

    #[test]
    fn test_hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), (1.0, 0.0, 0.0));
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), (0.0, 1.0, 0.0));
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), (0.0, 0.0, 1.0));
        assert_eq!(hsv_to_rgb(42.0, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_set_color_scales_channels() {
        let (bus, mut ctx, knob) = setup();
        knob.set_color(&mut ctx, 1.0, 0.5, -3.0).unwrap();

        let sent = bus.ops().into_iter().rev().find_map(|op| match op {
            BusOp::Transfer { command: command::SET_COLOR, sent, .. } => Some(sent),
            _ => None,
        });
        assert_eq!(sent, Some(vec![255, 128, 0]));
    }

    #[test]
    fn test_resolution_refreshes_cached_state() {
        let (bus, mut ctx, knob) = setup();
        bus.set_response(DeviceId::new(2), command::GET_BUTTON, &[1]);
        bus.set_response(DeviceId::new(2), command::GET_POSITION, &(-5i16).to_le_bytes());

        ctx.address(knob.key()).unwrap();

        let snapshot = knob.snapshot(&mut ctx).unwrap();
        assert!(snapshot.button);
        assert_eq!(snapshot.position, -5);
    }

    #[test]
    fn test_angle_wraps_negative_positions() {
        let (bus, mut ctx, knob) = setup();
        bus.set_response(DeviceId::new(2), command::GET_POSITION, &(-1i16).to_le_bytes());
        assert_eq!(knob.angle(&mut ctx).unwrap(), 345);
    }

    #[test]
    fn test_events_run_callbacks() {
        let (_bus, mut ctx, knob) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let press_log = log.clone();
        knob.on_button_press(&mut ctx, move |s| press_log.borrow_mut().push(("press", s.position)))
            .unwrap();
        let release_log = log.clone();
        knob.on_button_release(&mut ctx, move |s| release_log.borrow_mut().push(("release", s.position)))
            .unwrap();
        let turn_log = log.clone();
        knob.on_position_change(&mut ctx, move |s| turn_log.borrow_mut().push(("turn", s.position)))
            .unwrap();

        assert!(ctx.dispatch_event(knob.key(), event::POSITION_CHANGED, 7).unwrap());
        assert!(ctx.dispatch_event(knob.key(), event::BUTTON_CHANGED, 0x0100).unwrap());
        assert!(knob.snapshot(&mut ctx).unwrap().button);
        assert!(ctx.dispatch_event(knob.key(), event::BUTTON_CHANGED, 0x0001).unwrap());
        assert!(!ctx.dispatch_event(knob.key(), 99, 0).unwrap());

        assert_eq!(
            *log.borrow(),
            vec![("turn", 7), ("press", 7), ("release", 7)]
        );
        assert!(!knob.snapshot(&mut ctx).unwrap().button);
    }
}
