/*!
 * Color OLED display driver.
 *
 * Drawing is batched: each primitive becomes an op (an op code followed by
 * its arguments) that is assembled in a small buffer and sent as a single
 * transfer once the next op starts, on [`DisplayModule::flush`] or on
 * [`DisplayModule::refresh`]. While the device is pushing a frame to the
 * panel it cannot take new ops, so the first op after a refresh waits for
 * the refresh to finish.
 */
use std::time::Duration;

use tracing::{debug, trace};

use modulo_core::clock::Clock;
use modulo_core::types::DeviceId;

use crate::context::BusContext;
use crate::device::{DeviceError, Result};
use crate::devices::Driver;
use crate::protocol::{BusTransport, TransportError};
use crate::registry::HandleKey;

/// Device type string declared by displays
pub const DEVICE_TYPE: &str = "co.modulo.colordisplay";

/// Width in pixels
pub const WIDTH: u8 = 96;

/// Height in pixels
pub const HEIGHT: u8 = 64;

/// Number of buttons under the screen
pub const BUTTON_COUNT: u8 = 3;

/// Largest op the device accepts, op code included
pub const OP_BUFFER_SIZE: usize = 30;

const REFRESH_POLL_LIMIT: u32 = 100;
const REFRESH_POLL_INTERVAL: Duration = Duration::from_millis(5);

// Glyph cell of the built-in font at text size 1
const GLYPH_WIDTH: u8 = 6;

mod command {
    pub const APPEND_OP: u8 = 0;
    pub const IS_COMPLETE: u8 = 1;
    pub const GET_BUTTONS: u8 = 2;
}

mod op {
    pub const REFRESH: u8 = 0;
    pub const FILL_SCREEN: u8 = 1;
    pub const DRAW_LINE: u8 = 2;
    pub const SET_LINE_COLOR: u8 = 3;
    pub const SET_FILL_COLOR: u8 = 4;
    pub const SET_TEXT_COLOR: u8 = 5;
    pub const DRAW_RECT: u8 = 6;
    pub const DRAW_CIRCLE: u8 = 7;
    pub const DRAW_STRING: u8 = 9;
    pub const SET_CURSOR: u8 = 10;
    pub const SET_TEXT_SIZE: u8 = 11;
    pub const CLEAR: u8 = 12;
}

/// An RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
    /// Alpha; 0 is fully transparent
    pub a: u8,
}

impl Color {
    /// Opaque black
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    /// Opaque white
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    /// Fully transparent
    pub const CLEAR: Color = Color::rgba(0, 0, 0, 0);

    /// Opaque color
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 255)
    }

    /// Color with explicit alpha
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    fn bytes(&self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::CLEAR
    }
}

/// Horizontal placement for [`DisplayModule::draw_aligned_string`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAlignment {
    /// Start at the left edge
    #[default]
    Left,
    /// Centered on the screen
    Center,
    /// End at the right edge
    Right,
}

/// Display driver state kept in the module handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayState {
    pending: Vec<u8>,
    refreshing: bool,
    text_size: u8,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            pending: Vec::with_capacity(OP_BUFFER_SIZE),
            refreshing: false,
            text_size: 1,
        }
    }
}

impl DisplayState {
    /// Whether an op is being assembled
    pub fn has_pending_op(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a refresh was requested and not yet seen to complete
    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    fn current_op(&self) -> Option<u8> {
        self.pending.first().copied()
    }
}

/// Handle to a color display
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a module stays registered until it is released"]
pub struct DisplayModule {
    key: HandleKey,
}

impl DisplayModule {
    /// Use the first display not already claimed by another handle
    pub fn new<T: BusTransport, C: Clock>(ctx: &mut BusContext<T, C>) -> Self {
        Self {
            key: ctx.attach(DEVICE_TYPE, Driver::Display(DisplayState::default())),
        }
    }

    /// Use the display with the given device id
    pub fn with_device_id<T: BusTransport, C: Clock>(
        ctx: &mut BusContext<T, C>,
        device_id: DeviceId,
    ) -> Result<Self> {
        Ok(Self {
            key: ctx.attach_device(
                DEVICE_TYPE,
                device_id,
                Driver::Display(DisplayState::default()),
            )?,
        })
    }

    /// The registry key of this module
    pub fn key(&self) -> HandleKey {
        self.key
    }

    /// Remove this module from the bus context, discarding any pending op
    pub fn release<T: BusTransport, C: Clock>(self, ctx: &mut BusContext<T, C>) {
        ctx.detach(self.key);
    }

    /// Erase the screen and home the cursor
    pub fn clear<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<()> {
        self.op(ctx, op::CLEAR, &[])
    }

    /// Color for lines and shape outlines
    pub fn set_line_color<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        color: Color,
    ) -> Result<()> {
        self.op(ctx, op::SET_LINE_COLOR, &color.bytes())
    }

    /// Color used to fill shapes
    pub fn set_fill_color<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        color: Color,
    ) -> Result<()> {
        self.op(ctx, op::SET_FILL_COLOR, &color.bytes())
    }

    /// Color for text
    pub fn set_text_color<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        color: Color,
    ) -> Result<()> {
        self.op(ctx, op::SET_TEXT_COLOR, &color.bytes())
    }

    /// Text scale factor; 1 is a 6x8 pixel glyph cell
    pub fn set_text_size<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        size: u8,
    ) -> Result<()> {
        if size == 0 {
            return Err(DeviceError::InvalidArgument("text size must be at least 1".into()));
        }
        self.op(ctx, op::SET_TEXT_SIZE, &[size])?;
        state_mut(ctx, self.key)?.text_size = size;
        Ok(())
    }

    /// Paint the whole screen with `color`
    pub fn fill_screen<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        color: Color,
    ) -> Result<()> {
        self.op(ctx, op::FILL_SCREEN, &color.bytes())
    }

    /// Move the text cursor to (`x`, `y`)
    pub fn set_cursor<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        x: u8,
        y: u8,
    ) -> Result<()> {
        self.op(ctx, op::SET_CURSOR, &[x, y])
    }

    /// Line in the line color
    pub fn draw_line<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        x0: u8,
        y0: u8,
        x1: u8,
        y1: u8,
    ) -> Result<()> {
        self.op(ctx, op::DRAW_LINE, &[x0, y0, x1, y1])
    }

    /// Rectangle outlined in the line color and filled with the fill color
    pub fn draw_rect<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        x: u8,
        y: u8,
        width: u8,
        height: u8,
        radius: u8,
    ) -> Result<()> {
        self.op(ctx, op::DRAW_RECT, &[x, y, width, height, radius])
    }

    /// Circle outlined in the line color and filled with the fill color
    pub fn draw_circle<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        x: u8,
        y: u8,
        radius: u8,
    ) -> Result<()> {
        self.op(ctx, op::DRAW_CIRCLE, &[x, y, radius])
    }

    /// Text at the cursor in the text color
    ///
    /// Long strings are split over several ops; each carries a NUL terminator.
    pub fn draw_string<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        text: &str,
    ) -> Result<()> {
        for chunk in text.as_bytes().chunks(OP_BUFFER_SIZE - 2) {
            self.begin_op(ctx, op::DRAW_STRING)?;
            let state = state_mut(ctx, self.key)?;
            state.pending.extend_from_slice(chunk);
            state.pending.push(0);
        }
        Ok(())
    }

    /// Text on row `y`, placed horizontally according to `alignment`
    pub fn draw_aligned_string<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        text: &str,
        y: u8,
        alignment: TextAlignment,
    ) -> Result<()> {
        let text_size = state_mut(ctx, self.key)?.text_size;
        let glyph = usize::from(GLYPH_WIDTH) * usize::from(text_size);
        let width = text.len().saturating_mul(glyph);
        let slack = usize::from(WIDTH).saturating_sub(width);
        let x = match alignment {
            TextAlignment::Left => 0,
            TextAlignment::Center => slack / 2,
            TextAlignment::Right => slack,
        };
        // slack never exceeds WIDTH
        self.set_cursor(ctx, x as u8, y)?;
        self.draw_string(ctx, text)
    }

    /// Append one character to the text being drawn
    pub fn write<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>, byte: u8) -> Result<()> {
        let state = state_mut(ctx, self.key)?;
        let continues = state.current_op() == Some(op::DRAW_STRING)
            && state.pending.len() < OP_BUFFER_SIZE;
        if continues {
            // Overwrite the terminator
            state.pending.pop();
        } else {
            self.begin_op(ctx, op::DRAW_STRING)?;
        }
        let state = state_mut(ctx, self.key)?;
        state.pending.push(byte);
        state.pending.push(0);
        Ok(())
    }

    /// Send any op still being assembled
    pub fn flush<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<()> {
        let pending = std::mem::take(&mut state_mut(ctx, self.key)?.pending);
        if pending.is_empty() {
            return Ok(());
        }
        trace!(op = pending[0], len = pending.len(), "Sending display op");
        ctx.transfer(self.key, command::APPEND_OP, &pending, &mut [])
    }

    /// Push everything drawn so far to the panel
    pub fn refresh<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<()> {
        self.op(ctx, op::REFRESH, &[])?;
        self.flush(ctx)?;
        state_mut(ctx, self.key)?.refreshing = true;
        Ok(())
    }

    /// Whether the device has finished every op it was sent
    pub fn is_complete<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<bool> {
        let mut value = [0u8; 1];
        ctx.transfer(self.key, command::IS_COMPLETE, &[], &mut value)?;
        Ok(value[0] != 0)
    }

    /// Block until a requested refresh has finished
    ///
    /// Polls the device a bounded number of times; on timeout the refresh is
    /// considered over so later ops are not stuck behind it.
    pub fn wait_on_refresh<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<()> {
        if !state_mut(ctx, self.key)?.refreshing {
            return Ok(());
        }

        for poll in 0..REFRESH_POLL_LIMIT {
            if poll > 0 {
                ctx.clock.sleep(REFRESH_POLL_INTERVAL);
            }
            if self.is_complete(ctx)? {
                state_mut(ctx, self.key)?.refreshing = false;
                return Ok(());
            }
        }

        debug!(polls = REFRESH_POLL_LIMIT, "Display refresh did not complete");
        state_mut(ctx, self.key)?.refreshing = false;
        Err(TransportError::Timeout.into())
    }

    /// Whether button `button` (0, 1 or 2) is pressed
    pub fn button<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        button: u8,
    ) -> Result<bool> {
        if button >= BUTTON_COUNT {
            return Err(DeviceError::InvalidArgument(format!(
                "button {} out of range 0..{}",
                button, BUTTON_COUNT
            )));
        }
        Ok(self.buttons(ctx)? & (1 << button) != 0)
    }

    /// State of all buttons, one per bit
    pub fn buttons<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>) -> Result<u8> {
        let mut value = [0u8; 1];
        ctx.transfer(self.key, command::GET_BUTTONS, &[], &mut value)?;
        Ok(value[0])
    }

    fn op<T: BusTransport, C: Clock>(
        &self,
        ctx: &mut BusContext<T, C>,
        code: u8,
        args: &[u8],
    ) -> Result<()> {
        self.begin_op(ctx, code)?;
        state_mut(ctx, self.key)?.pending.extend_from_slice(args);
        Ok(())
    }

    /// Send the previous op, wait out any refresh, then start a new op
    fn begin_op<T: BusTransport, C: Clock>(&self, ctx: &mut BusContext<T, C>, code: u8) -> Result<()> {
        self.flush(ctx)?;
        self.wait_on_refresh(ctx)?;
        state_mut(ctx, self.key)?.pending.push(code);
        Ok(())
    }
}

fn state_mut<T: BusTransport, C: Clock>(
    ctx: &mut BusContext<T, C>,
    key: HandleKey,
) -> Result<&mut DisplayState> {
    match &mut ctx.handle_mut(key)?.driver {
        Driver::Display(state) => Ok(state),
        _ => Err(DeviceError::UnknownHandle),
    }
}

/// A freshly addressed display has lost anything sent before; start clean
pub(crate) fn on_resolved<T: BusTransport, C: Clock>(
    ctx: &mut BusContext<T, C>,
    key: HandleKey,
) -> Result<()> {
    let state = state_mut(ctx, key)?;
    state.refreshing = false;
    state.text_size = 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use modulo_core::clock::ManualClock;

    use super::*;
    use crate::context::BusSettings;
    use crate::protocols::simulated::{BusOp, SimulatedBus};

    fn setup() -> (SimulatedBus, BusContext<SimulatedBus, ManualClock>, DisplayModule) {
        let bus = SimulatedBus::new();
        bus.add_device(6, DEVICE_TYPE);
        let mut ctx = BusContext::new(bus.clone(), ManualClock::new(), BusSettings::default());
        let display = DisplayModule::new(&mut ctx);
        (bus, ctx, display)
    }

    fn sent_ops(bus: &SimulatedBus) -> Vec<Vec<u8>> {
        bus.ops()
            .into_iter()
            .filter_map(|entry| match entry {
                BusOp::Transfer {
                    command: command::APPEND_OP,
                    sent,
                    ..
                } => Some(sent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ops_are_sent_when_the_next_one_starts() {
        let (bus, mut ctx, display) = setup();

        display.set_line_color(&mut ctx, Color::WHITE).unwrap();
        assert!(sent_ops(&bus).is_empty());
        assert!(state_mut(&mut ctx, display.key()).unwrap().has_pending_op());

        display.draw_line(&mut ctx, 0, 1, 95, 63).unwrap();
        display.refresh(&mut ctx).unwrap();

        let state = state_mut(&mut ctx, display.key()).unwrap();
        assert!(!state.has_pending_op());
        assert!(state.is_refreshing());

        assert_eq!(
            sent_ops(&bus),
            vec![
                vec![op::SET_LINE_COLOR, 255, 255, 255, 255],
                vec![op::DRAW_LINE, 0, 1, 95, 63],
                vec![op::REFRESH],
            ]
        );
    }

    #[test]
    fn test_long_strings_are_split() {
        let (bus, mut ctx, display) = setup();
        let text = "a".repeat(30);

        display.draw_string(&mut ctx, &text).unwrap();
        display.flush(&mut ctx).unwrap();

        let ops = sent_ops(&bus);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|sent| sent.len() <= OP_BUFFER_SIZE));
        assert_eq!(ops[0].len(), OP_BUFFER_SIZE);
        assert_eq!(ops[1], vec![op::DRAW_STRING, b'a', b'a', 0]);
    }

    #[test]
    fn test_write_extends_current_string() {
        let (bus, mut ctx, display) = setup();
        for byte in b"hi" {
            display.write(&mut ctx, *byte).unwrap();
        }
        display.flush(&mut ctx).unwrap();

        assert_eq!(sent_ops(&bus), vec![vec![op::DRAW_STRING, b'h', b'i', 0]]);
    }

    #[test]
    fn test_next_op_waits_for_refresh() {
        let (bus, mut ctx, display) = setup();
        let id = DeviceId::new(6);

        display.refresh(&mut ctx).unwrap();
        bus.queue_response(id, command::IS_COMPLETE, &[0]);
        bus.queue_response(id, command::IS_COMPLETE, &[0]);
        bus.set_response(id, command::IS_COMPLETE, &[1]);

        display.clear(&mut ctx).unwrap();

        let polls = bus.count(|entry| {
            matches!(
                entry,
                BusOp::Transfer {
                    command: command::IS_COMPLETE,
                    ..
                }
            )
        });
        assert_eq!(polls, 3);
        assert!(!state_mut(&mut ctx, display.key()).unwrap().is_refreshing());
        assert_eq!(ctx.clock().sleeps(), vec![
            Duration::from_millis(100),
            REFRESH_POLL_INTERVAL,
            REFRESH_POLL_INTERVAL,
        ]);
    }

    #[test]
    fn test_aligned_string_positions_cursor() {
        let (bus, mut ctx, display) = setup();

        display
            .draw_aligned_string(&mut ctx, "abcd", 10, TextAlignment::Right)
            .unwrap();
        display.flush(&mut ctx).unwrap();

        assert_eq!(sent_ops(&bus)[0], vec![op::SET_CURSOR, 72, 10]);
    }

    #[test]
    fn test_buttons() {
        let (bus, mut ctx, display) = setup();
        bus.set_response(DeviceId::new(6), command::GET_BUTTONS, &[0b100]);

        assert!(display.button(&mut ctx, 2).unwrap());
        assert!(!display.button(&mut ctx, 0).unwrap());
        assert!(matches!(
            display.button(&mut ctx, 3),
            Err(DeviceError::InvalidArgument(_))
        ));
    }
}
