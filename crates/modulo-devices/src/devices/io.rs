/*!
 * Digital/analog I/O board driver.
 *
 * Eight pins, each usable as digital input or output, analog input or PWM
 * output, with per-pin pull-up and debounce.
 */
use modulo_core::clock::Clock;
use modulo_core::types::DeviceId;

use crate::context::BusContext;
use crate::device::{DeviceError, Result};
use crate::devices::Driver;
use crate::protocol::BusTransport;
use crate::registry::HandleKey;

/// Device type string declared by I/O boards
pub const DEVICE_TYPE: &str = "co.modulo.io";

/// Number of pins on the board
pub const PIN_COUNT: u8 = 8;

mod command {
    pub const GET_DIGITAL_INPUT: u8 = 0;
    pub const GET_DIGITAL_INPUTS: u8 = 1;
    pub const GET_ANALOG_INPUT: u8 = 2;
    pub const SET_DATA_DIRECTION: u8 = 3;
    pub const SET_DATA_DIRECTIONS: u8 = 4;
    pub const SET_DIGITAL_OUTPUT: u8 = 5;
    pub const SET_DIGITAL_OUTPUTS: u8 = 6;
    pub const SET_PWM_OUTPUT: u8 = 7;
    pub const SET_PULLUP: u8 = 8;
    pub const SET_PULLUPS: u8 = 9;
    pub const SET_DEBOUNCE: u8 = 10;
    pub const SET_DEBOUNCES: u8 = 11;
    pub const SET_PWM_FREQUENCY: u8 = 12;
}

/// Reference voltage for analog reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AnalogReference {
    /// Supply voltage
    #[default]
    Vcc = 0,
    /// Internal bandgap reference
    Internal = 1,
    /// Voltage on the external reference pin
    External = 2,
}

/// Handle to an I/O board
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a module stays registered until it is released"]
pub struct IoModule {
    key: HandleKey,
}

impl IoModule {
    /// Use the first I/O board not already claimed by another handle
    pub fn new<T: BusTransport, C: Clock>(ctx: &mut BusContext<T, C>) -> Self {
        Self {
            key: ctx.attach(DEVICE_TYPE, Driver::Io),
        }
    }

    /// Use the I/O board with the given device id
    pub fn with_device_id<T: BusTransport, C: Clock>(
        ctx: &mut BusContext<T, C>,
        device_id: DeviceId,
    ) -> Result<Self> {
        Ok(Self {
            key: ctx.attach_device(DEVICE_TYPE, device_id, Driver::Io)?,
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

    /// Read one pin as a digital input
    pub fn digital_input<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
    ) -> Result<bool> {
        check_pin(pin)?;
        let mut value = [0u8; 1];
        ctx.transfer(self.key, command::GET_DIGITAL_INPUT, &[pin], &mut value)?;
        Ok(value[0] != 0)
    }

    /// Read all pins as digital inputs, one bit per pin
    pub fn digital_inputs<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<u8> {
        let mut value = [0u8; 1];
        ctx.transfer(self.key, command::GET_DIGITAL_INPUTS, &[], &mut value)?;
        Ok(value[0])
    }

    /// Read one pin as an analog input, scaled to `0.0..=1.0`
    pub fn analog_input<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        reference: AnalogReference,
    ) -> Result<f32> {
        check_pin(pin)?;
        let mut value = [0u8; 2];
        ctx.transfer(
            self.key,
            command::GET_ANALOG_INPUT,
            &[pin, reference as u8],
            &mut value,
        )?;
        Ok(f32::from(u16::from_le_bytes(value)) / 1023.0)
    }

    /// Configure one pin as output (`true`) or input (`false`)
    pub fn set_data_direction<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        output: bool,
    ) -> Result<()> {
        self.pin_flag(ctx, command::SET_DATA_DIRECTION, pin, output)
    }

    /// Configure all pin directions at once, one bit per pin
    pub fn set_data_directions<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        outputs: u8,
    ) -> Result<()> {
        ctx.transfer(self.key, command::SET_DATA_DIRECTIONS, &[outputs], &mut [])
    }

    /// Drive one pin high or low
    pub fn set_digital_output<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        value: bool,
    ) -> Result<()> {
        self.pin_flag(ctx, command::SET_DIGITAL_OUTPUT, pin, value)
    }

    /// Drive all pins at once, one bit per pin
    pub fn set_digital_outputs<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        values: u8,
    ) -> Result<()> {
        ctx.transfer(self.key, command::SET_DIGITAL_OUTPUTS, &[values], &mut [])
    }

    /// Set the PWM duty cycle of one pin; `value` is clamped to `0.0..=1.0`
    pub fn set_pwm_value<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        value: f32,
    ) -> Result<()> {
        check_pin(pin)?;
        let duty = (65535.0 * value.clamp(0.0, 1.0)) as u16;
        let [lo, hi] = duty.to_le_bytes();
        ctx.transfer(self.key, command::SET_PWM_OUTPUT, &[pin, lo, hi], &mut [])
    }

    /// Enable or disable the pull-up on one pin
    pub fn set_pullup<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        enable: bool,
    ) -> Result<()> {
        self.pin_flag(ctx, command::SET_PULLUP, pin, enable)
    }

    /// Configure all pull-ups at once, one bit per pin
    pub fn set_pullups<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        enabled: u8,
    ) -> Result<()> {
        ctx.transfer(self.key, command::SET_PULLUPS, &[enabled], &mut [])
    }

    /// Enable or disable input debouncing on one pin
    pub fn set_debounce<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        enable: bool,
    ) -> Result<()> {
        self.pin_flag(ctx, command::SET_DEBOUNCE, pin, enable)
    }

    /// Configure debouncing on all pins at once, one bit per pin
    pub fn set_debounces<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        enabled: u8,
    ) -> Result<()> {
        ctx.transfer(self.key, command::SET_DEBOUNCES, &[enabled], &mut [])
    }

    /// Set the PWM frequency of one pin, in hertz
    pub fn set_pwm_frequency<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        pin: u8,
        hertz: u16,
    ) -> Result<()> {
        check_pin(pin)?;
        let [lo, hi] = hertz.to_le_bytes();
        ctx.transfer(self.key, command::SET_PWM_FREQUENCY, &[pin, lo, hi], &mut [])
    }

    fn pin_flag<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        command: u8,
        pin: u8,
        flag: bool,
    ) -> Result<()> {
        check_pin(pin)?;
        ctx.transfer(self.key, command, &[pin, u8::from(flag)], &mut [])
    }
}

fn check_pin(pin: u8) -> Result<()> {
    if pin >= PIN_COUNT {
        return Err(DeviceError::InvalidArgument(format!(
            "pin {} out of range 0..{}",
            pin, PIN_COUNT
        )));
    }
    Ok(())
}

/// I/O boards need no setup after resolution
pub(crate) fn on_resolved<T: BusTransport, C: Clock>(
    _ctx: &mut BusContext<T, C>,
    _key: HandleKey,
) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use modulo_core::clock::ManualClock;

    use super::*;
    use crate::context::BusSettings;
    use crate::protocols::simulated::{BusOp, SimulatedBus};

    fn setup() -> (SimulatedBus, BusContext<SimulatedBus, ManualClock>, IoModule) {
        let bus = SimulatedBus::new();
        bus.add_device(4, DEVICE_TYPE);
        let mut ctx = BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default());
        let io = IoModule::new(&mut ctx);
        (bus, ctx, io)
    }

    fn last_sent(bus: &SimulatedBus) -> (u8, Vec<u8>) {
        bus.ops()
            .into_iter()
            .rev()
            .find_map(|op| match op {
                BusOp::Transfer { command, sent, .. } => Some((command, sent)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_digital_input() {
        let (bus, mut ctx, io) = setup();
        bus.set_response(DeviceId::new(4), command::GET_DIGITAL_INPUT, &[1]);

        assert!(io.digital_input(&mut ctx, 3).unwrap());
        assert_eq!(last_sent(&bus), (command::GET_DIGITAL_INPUT, vec![3]));
    }

    #[test]
    fn test_analog_input_scaling() {
        let (bus, mut ctx, io) = setup();
        bus.set_response(DeviceId::new(4), command::GET_ANALOG_INPUT, &[0xFF, 0x03]);

        let value = io.analog_input(&mut ctx, 0, AnalogReference::Internal).unwrap();
        assert!((value - 1.0).abs() < f32::EPSILON);
        assert_eq!(last_sent(&bus), (command::GET_ANALOG_INPUT, vec![0, 1]));
    }

    #[test]
    fn test_pwm_value_is_clamped() {
        let (bus, mut ctx, io) = setup();

        io.set_pwm_value(&mut ctx, 2, 1.5).unwrap();
        assert_eq!(last_sent(&bus), (command::SET_PWM_OUTPUT, vec![2, 0xFF, 0xFF]));

        io.set_pwm_value(&mut ctx, 2, -1.0).unwrap();
        assert_eq!(last_sent(&bus), (command::SET_PWM_OUTPUT, vec![2, 0, 0]));
    }

    #[test]
    fn test_pwm_frequency_is_little_endian() {
        let (bus, mut ctx, io) = setup();
        io.set_pwm_frequency(&mut ctx, 1, 0x1234).unwrap();
        assert_eq!(last_sent(&bus), (command::SET_PWM_FREQUENCY, vec![1, 0x34, 0x12]));
    }

    #[test]
    fn test_pin_flags() {
        let (bus, mut ctx, io) = setup();
        io.set_pullup(&mut ctx, 5, true).unwrap();
        assert_eq!(last_sent(&bus), (command::SET_PULLUP, vec![5, 1]));
        io.set_debounces(&mut ctx, 0b1010_0000).unwrap();
        assert_eq!(last_sent(&bus), (command::SET_DEBOUNCES, vec![0b1010_0000]));
    }

    #[test]
    fn test_invalid_pin_makes_no_bus_call() {
        let (bus, mut ctx, io) = setup();
        let result = io.set_digital_output(&mut ctx, 8, true);
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
        assert_eq!(bus.count(|op| matches!(op, BusOp::Transfer { .. })), 0);
    }

    #[test]
    fn test_release_frees_the_device() {
        let (_bus, mut ctx, io) = setup();
        io.digital_inputs(&mut ctx).unwrap();
        assert!(matches!(
            IoModule::with_device_id(&mut ctx, DeviceId::new(4)),
            Err(DeviceError::AlreadyClaimed { .. })
        ));

        io.release(&mut ctx);
        assert_eq!(ctx.registry().len(), 0);

        let io = IoModule::with_device_id(&mut ctx, DeviceId::new(4)).unwrap();
        assert_eq!(ctx.device_id(io.key()).unwrap(), DeviceId::new(4));
        io.release(&mut ctx);
    }
}
