use crate::client::{MappingListener, SyncClient};
use crate::config::ControllerConfig;
use crate::display::{dim_color, Color, DisplaySink, DEFAULT_SWITCH_COLOR};
use crate::mapping::{MappingId, ParameterMapping, MAX_SET_SLOTS};
use crate::routing::MidiRouter;
use crate::timing::Millis;
use heapless::Vec;
use tracing::{trace, warn};

/// How an observed parameter value maps to the boolean state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonMode {
    Equal,
    Greater,
    #[default]
    GreaterEqual,
    Less,
    LessEqual,
    /// Value ignored for state purposes; only the user moves the state. Used
    /// for parameters that should display but never drive the boolean.
    NoStateChange,
}

/// Per-slot value sent when the action turns off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableValue {
    Fixed(u16),
    /// Resend whatever value was observed before the action turned off,
    /// captured from the most recent value seen while the state was false.
    RememberLast,
}

/// Physical switch interaction style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonMode {
    /// Press toggles.
    Latch,
    /// Enabled only while held.
    Momentary,
    /// Toggles once the press has lasted at least this long.
    Hold(Millis),
}

#[derive(Debug, Clone)]
pub struct BinaryActionConfig {
    pub text: String,
    pub text_disabled: Option<String>,
    pub color: Color,
    /// One value per set slot of the mapping.
    pub value_enable: Vec<u16, MAX_SET_SLOTS>,
    pub value_disable: Vec<DisableValue, MAX_SET_SLOTS>,
    /// Defaults to the first enable value.
    pub reference_value: Option<u16>,
    pub comparison: ComparisonMode,
    pub button_mode: ButtonMode,
    /// When set, the state flips immediately on toggle instead of waiting for
    /// the device echo.
    pub use_internal_state: bool,
    /// Overrides for the controller-wide LED brightness pair (on, off).
    pub led_brightness: Option<(f32, f32)>,
    /// Overrides for the controller-wide label dim pair (on, off).
    pub display_dim: Option<(f32, f32)>,
    /// Derives the indicator color from the current value (e.g. tuner note
    /// coloring) instead of the fixed `color`.
    pub color_hook: Option<fn(u16) -> Color>,
}

impl Default for BinaryActionConfig {
    fn default() -> Self {
        let mut value_enable = Vec::new();
        let _ = value_enable.push(127);
        let mut value_disable = Vec::new();
        let _ = value_disable.push(DisableValue::Fixed(0));
        Self {
            text: String::new(),
            text_disabled: None,
            color: DEFAULT_SWITCH_COLOR,
            value_enable,
            value_disable,
            reference_value: None,
            comparison: ComparisonMode::default(),
            button_mode: ButtonMode::Latch,
            use_internal_state: true,
            led_brightness: None,
            display_dim: None,
            color_hook: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DisableSlot {
    value: DisableValue,
    captured: Option<u16>,
}

impl DisableSlot {
    fn resolve(&self) -> Option<u16> {
        match self.value {
            DisableValue::Fixed(value) => Some(value),
            DisableValue::RememberLast => self.captured,
        }
    }
}

/// Two-state switch action bound to one parameter mapping.
///
/// The state follows the synchronized value through the configured comparison
/// and can be moved by the user through [`BinaryParameterAction::press`] /
/// [`BinaryParameterAction::release`]. Loss of synchronization (request
/// termination) forces the disabled state and an offline indication.
pub struct BinaryParameterAction {
    mapping: MappingId,
    text: String,
    text_disabled: Option<String>,
    color: Color,
    color_hook: Option<fn(u16) -> Color>,
    value_enable: Vec<u16, MAX_SET_SLOTS>,
    disable_slots: Vec<DisableSlot, MAX_SET_SLOTS>,
    reference_value: u16,
    comparison: ComparisonMode,
    button_mode: ButtonMode,
    use_internal_state: bool,
    led_on: f32,
    led_off: f32,
    dim_on: f32,
    dim_off: f32,
    state: bool,
    online: bool,
    last_value: Option<u16>,
    pressed_at: Option<Millis>,
    display_cache: Option<(bool, bool, Option<u16>)>,
}

impl BinaryParameterAction {
    pub fn new(
        mapping: MappingId,
        config: BinaryActionConfig,
        controller: &ControllerConfig,
    ) -> Self {
        let reference_value = config
            .reference_value
            .or_else(|| config.value_enable.first().copied())
            .unwrap_or(0);
        let (led_on, led_off) = config
            .led_brightness
            .unwrap_or((controller.led_brightness_on, controller.led_brightness_off));
        let (dim_on, dim_off) = config
            .display_dim
            .unwrap_or((controller.display_dim_on, controller.display_dim_off));

        let mut disable_slots = Vec::new();
        for &value in &config.value_disable {
            let _ = disable_slots.push(DisableSlot {
                value,
                captured: None,
            });
        }

        Self {
            mapping,
            text: config.text,
            text_disabled: config.text_disabled,
            color: config.color,
            color_hook: config.color_hook,
            value_enable: config.value_enable,
            disable_slots,
            reference_value,
            comparison: config.comparison,
            button_mode: config.button_mode,
            use_internal_state: config.use_internal_state,
            led_on,
            led_off,
            dim_on,
            dim_off,
            state: false,
            online: true,
            last_value: None,
            pressed_at: None,
            display_cache: None,
        }
    }

    pub fn mapping(&self) -> MappingId {
        self.mapping
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Physical switch pressed.
    pub fn press(
        &mut self,
        client: &mut SyncClient,
        router: &mut MidiRouter,
        now: Millis,
    ) {
        match self.button_mode {
            ButtonMode::Latch => {
                let target = !self.state;
                self.apply_user_state(target, client, router, now);
            }
            ButtonMode::Momentary => self.apply_user_state(true, client, router, now),
            ButtonMode::Hold(_) => self.pressed_at = Some(now),
        }
    }

    /// Physical switch released.
    pub fn release(
        &mut self,
        client: &mut SyncClient,
        router: &mut MidiRouter,
        now: Millis,
    ) {
        match self.button_mode {
            ButtonMode::Latch => {}
            ButtonMode::Momentary => self.apply_user_state(false, client, router, now),
            ButtonMode::Hold(hold_ms) => {
                if let Some(pressed_at) = self.pressed_at.take() {
                    if now.saturating_sub(pressed_at) >= hold_ms {
                        let target = !self.state;
                        self.apply_user_state(target, client, router, now);
                    }
                }
            }
        }
    }

    /// Redraws the switch indication, but only when state, connectivity or
    /// value changed since the last redraw. Safe to call every tick.
    pub fn update_display(&mut self, sink: &mut dyn DisplaySink) {
        let signature = (self.state, self.online, self.last_value);
        if self.display_cache == Some(signature) {
            return;
        }
        self.display_cache = Some(signature);

        let color = match self.color_hook {
            Some(hook) => self.last_value.map_or(self.color, hook),
            None => self.color,
        };

        if !self.online {
            sink.set_color(dim_color(color, self.dim_off));
            sink.set_brightness(self.led_off);
            sink.set_text("?");
            return;
        }

        if self.state {
            sink.set_color(dim_color(color, self.dim_on));
            sink.set_brightness(self.led_on);
            sink.set_text(&self.text);
        } else {
            sink.set_color(dim_color(color, self.dim_off));
            sink.set_brightness(self.led_off);
            sink.set_text(self.text_disabled.as_deref().unwrap_or(&self.text));
        }
    }

    /// Sends the enable or disable values for the requested state and
    /// re-requests the mapping so the display refreshes from the device's
    /// authoritative value.
    fn apply_user_state(
        &mut self,
        target: bool,
        client: &mut SyncClient,
        router: &mut MidiRouter,
        now: Millis,
    ) {
        if self.use_internal_state {
            self.state = target;
            self.display_cache = None;
        }

        if target {
            let values: std::vec::Vec<u16> = self.value_enable.iter().copied().collect();
            if let Err(err) = client.set_slots(self.mapping, &values, router) {
                warn!(%err, "enable values rejected");
            }
        } else if let Some(values) = self.resolved_disable_values() {
            if let Err(err) = client.set_slots(self.mapping, &values, router) {
                warn!(%err, "disable values rejected");
            }
        } else {
            // Remember-last slots with nothing captured yet: sending a made-up
            // value would clobber the device, so only refresh.
            trace!("disable values not yet captured, skipping send");
        }

        client.request(self.mapping, router, now);
    }

    fn resolved_disable_values(&self) -> Option<std::vec::Vec<u16>> {
        self.disable_slots.iter().map(DisableSlot::resolve).collect()
    }

    /// Recomputes the state from an observed value (or its absence).
    fn evaluate(&mut self, value: Option<u16>) {
        self.last_value = value;
        let Some(value) = value else {
            self.state = false;
            return;
        };

        self.state = match self.comparison {
            ComparisonMode::Equal => value == self.reference_value,
            ComparisonMode::Greater => value > self.reference_value,
            ComparisonMode::GreaterEqual => value >= self.reference_value,
            ComparisonMode::Less => value < self.reference_value,
            ComparisonMode::LessEqual => value <= self.reference_value,
            ComparisonMode::NoStateChange => self.state,
        };

        if !self.state {
            // Every disabled observation refreshes the capture, so the
            // off-transition resends the latest pre-off value.
            for slot in &mut self.disable_slots {
                if slot.value == DisableValue::RememberLast {
                    slot.captured = Some(value);
                }
            }
        }
    }
}

impl MappingListener for BinaryParameterAction {
    fn parameter_changed(&mut self, mapping: &ParameterMapping) {
        self.online = true;
        self.evaluate(mapping.value());
    }

    fn request_terminated(&mut self, _mapping: &ParameterMapping) {
        self.online = false;
        self.evaluate(None);
    }
}

impl core::fmt::Debug for BinaryParameterAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BinaryParameterAction")
            .field("mapping", &self.mapping)
            .field("state", &self.state)
            .field("online", &self.online)
            .field("comparison", &self.comparison)
            .field("button_mode", &self.button_mode)
            .finish()
    }
}
