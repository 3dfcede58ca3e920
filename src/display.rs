use crate::timing::Millis;
use serde::{Deserialize, Serialize};

/// RGB color triple for switch LEDs and display label backgrounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8);

impl Default for Color {
    fn default() -> Self {
        DEFAULT_SWITCH_COLOR
    }
}

pub const DEFAULT_SWITCH_COLOR: Color = Color(255, 255, 255);
pub const COLOR_GREEN: Color = Color(0, 255, 0);
pub const COLOR_ORANGE: Color = Color(255, 125, 0);
pub const COLOR_DARK: Color = Color(50, 50, 50);

/// Scales a color by a factor in [0..1].
pub fn dim_color(color: Color, factor: f32) -> Color {
    let factor = factor.clamp(0.0, 1.0);
    Color(
        (f32::from(color.0) * factor) as u8,
        (f32::from(color.1) * factor) as u8,
        (f32::from(color.2) * factor) as u8,
    )
}

/// Output-only sink for one visual element (a switch LED, a display label).
/// Updates are fire-and-forget; the sink never reports back.
pub trait DisplaySink {
    fn set_color(&mut self, color: Color);
    fn set_brightness(&mut self, brightness: f32);
    fn set_text(&mut self, text: &str);
}

/// Transient value preview on a display label: shows a text for a bounded
/// time, then blanks the label again. Driven by `update` every tick.
#[derive(Debug, Clone, Copy)]
pub struct ValuePreview {
    timeout_ms: Millis,
    active_until: Option<Millis>,
}

impl ValuePreview {
    pub fn new(timeout_ms: Millis) -> Self {
        Self {
            timeout_ms,
            active_until: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_until.is_some()
    }

    /// Shows `text` and re-arms the timeout.
    pub fn preview(&mut self, sink: &mut dyn DisplaySink, text: &str, now: Millis) {
        sink.set_text(text);
        self.active_until = Some(now + self.timeout_ms);
    }

    /// Shows a value scaled to percent of the mapping range.
    pub fn preview_scaled(
        &mut self,
        sink: &mut dyn DisplaySink,
        value: u16,
        max_value: u16,
        now: Millis,
    ) {
        let percent = if max_value == 0 {
            0
        } else {
            (u32::from(value) * 100 / u32::from(max_value)) as u16
        };
        let text = format!("{percent}%");
        self.preview(sink, &text, now);
    }

    /// Blanks the label once the preview timeout has elapsed.
    pub fn update(&mut self, sink: &mut dyn DisplaySink, now: Millis) {
        if let Some(until) = self.active_until {
            if now >= until {
                sink.set_text("");
                self.active_until = None;
            }
        }
    }
}
