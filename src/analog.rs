use crate::client::SyncClient;
use crate::display::{DisplaySink, ValuePreview};
use crate::mapping::MappingId;
use crate::routing::MidiRouter;
use crate::timing::{Millis, PeriodCounter};
use tracing::trace;

/// Size of the raw sample domain (16-bit ADC range).
const RAW_RANGE: u32 = 65536;

pub const DEFAULT_FRAME_RATE: u16 = 24;
pub const DEFAULT_NUM_STEPS: u16 = 128;
pub const DEFAULT_CAL_MIN_SPAN: f32 = 0.25;
pub const DEFAULT_CHANGE_TIMEOUT_MS: Millis = 1500;

/// Tuning for one analog input (expression pedal, wheel, fader).
#[derive(Debug, Clone)]
pub struct AnalogConfig {
    /// Upper bound on outgoing value frames; faster sampling is deliberately
    /// ignored to bound wire traffic.
    pub max_frame_rate: u16,
    /// Number of distinguishable steps. Coarser steps save wire traffic at
    /// the cost of precision.
    pub num_steps: u16,
    /// Output range override; `None` derives 16383/127 from the mapping.
    pub max_value: Option<u16>,
    /// Kemper-style range auto-calibration.
    pub auto_calibrate: bool,
    /// Minimum fraction of the raw range the input has to cover before any
    /// output is emitted.
    pub cal_min_span: f32,
    /// How long a changed value stays on the preview display.
    pub change_timeout_ms: Millis,
    /// Whether changed values are previewed at all.
    pub show_preview: bool,
}

impl Default for AnalogConfig {
    fn default() -> Self {
        Self {
            max_frame_rate: DEFAULT_FRAME_RATE,
            num_steps: DEFAULT_NUM_STEPS,
            max_value: None,
            auto_calibrate: true,
            cal_min_span: DEFAULT_CAL_MIN_SPAN,
            change_timeout_ms: DEFAULT_CHANGE_TIMEOUT_MS,
            show_preview: false,
        }
    }
}

/// Calibration lifecycle of one input. The window only ever widens within a
/// session; re-calibration means rebuilding the control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    Calibrating,
    Active,
}

/// Conditioning pipeline for one analog input: frame-rate gate, range
/// auto-calibration, quantization and redundant-output suppression, feeding
/// set-requests into the synchronization engine.
pub struct AnalogControl {
    mapping: MappingId,
    frame_gate: PeriodCounter,
    auto_calibrate: bool,
    min_span: u32,
    window: Option<(u16, u16)>,
    cal_factor: f32,
    step_width: u32,
    max_value: u16,
    out_factor: f32,
    last_output: Option<u16>,
    transfer: Option<fn(u16) -> u16>,
    convert_value: Option<fn(u16) -> String>,
    preview: Option<ValuePreview>,
}

impl AnalogControl {
    /// `client` is only consulted to derive the output range from the
    /// mapping's wire templates.
    pub fn new(mapping: MappingId, client: &SyncClient, config: &AnalogConfig) -> Self {
        let max_value = config
            .max_value
            .unwrap_or_else(|| client.mapping(mapping).max_value());
        let num_steps = config.num_steps.max(1);
        let frame_period = 1000 / Millis::from(config.max_frame_rate.max(1));
        // A span below one raw unit would divide by zero on rescale.
        let min_span = ((RAW_RANGE as f32 * config.cal_min_span) as u32).max(1);

        Self {
            mapping,
            frame_gate: PeriodCounter::new(frame_period),
            auto_calibrate: config.auto_calibrate,
            min_span,
            window: None,
            cal_factor: 1.0,
            step_width: (RAW_RANGE / u32::from(num_steps)).max(1),
            max_value,
            out_factor: RAW_RANGE as f32 / (f32::from(max_value) + 1.0),
            last_output: None,
            transfer: None,
            convert_value: None,
            preview: config
                .show_preview
                .then(|| ValuePreview::new(config.change_timeout_ms)),
        }
    }

    /// Replaces quantization and rescaling with a caller-supplied transfer
    /// function from the raw (calibrated) domain to the mapping domain.
    pub fn with_transfer(mut self, transfer: fn(u16) -> u16) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Custom value-to-text conversion for the preview display.
    pub fn with_convert_value(mut self, convert: fn(u16) -> String) -> Self {
        self.convert_value = Some(convert);
        self
    }

    pub fn mapping(&self) -> MappingId {
        self.mapping
    }

    pub fn state(&self) -> CalibrationState {
        if !self.auto_calibrate {
            return CalibrationState::Active;
        }
        match self.window {
            None => CalibrationState::Uncalibrated,
            Some((lo, hi)) if u32::from(hi - lo) < self.min_span => CalibrationState::Calibrating,
            Some(_) => CalibrationState::Active,
        }
    }

    /// Processes a raw sample in [0..65535]. Emits at most one set-request,
    /// and only when the quantized output actually changed.
    pub fn process(
        &mut self,
        raw: u16,
        client: &mut SyncClient,
        router: &mut MidiRouter,
        mut sink: Option<&mut dyn DisplaySink>,
        now: Millis,
    ) {
        if !self.frame_gate.exceeded(now) {
            return;
        }

        let mut value = u32::from(raw);

        if self.auto_calibrate {
            let Some((lo, _)) = self.widen_window(raw) else {
                // Window still narrower than the minimum span: the physical
                // range of motion has not been explored yet, emit nothing.
                return;
            };
            value = ((f32::from(raw - lo) * self.cal_factor) as u32).min(RAW_RANGE - 1);
        }

        let output = match self.transfer {
            Some(transfer) => transfer(value.min(RAW_RANGE - 1) as u16),
            None => {
                let quantized =
                    ((value as f32 / self.step_width as f32).round() as u32) * self.step_width;
                let scaled = (quantized as f32 / self.out_factor) as u32;
                scaled.min(u32::from(self.max_value)) as u16
            }
        };

        if self.last_output == Some(output) {
            return;
        }
        self.last_output = Some(output);
        trace!(output, "analog value changed");
        client.set(self.mapping, output, router);

        if let (Some(preview), Some(sink)) = (self.preview.as_mut(), sink.as_deref_mut()) {
            match self.convert_value {
                Some(convert) => preview.preview(sink, &convert(output), now),
                None => preview.preview_scaled(sink, output, self.max_value, now),
            }
        }
    }

    /// Per-tick housekeeping: reverts the preview display after its timeout.
    pub fn update(&mut self, sink: &mut dyn DisplaySink, now: Millis) {
        if let Some(preview) = self.preview.as_mut() {
            preview.update(sink, now);
        }
    }

    /// Widens the calibration window to include `raw` and returns it once it
    /// meets the minimum span, recomputing the scale factor on every change.
    fn widen_window(&mut self, raw: u16) -> Option<(u16, u16)> {
        let (mut lo, mut hi) = match self.window {
            None => {
                self.window = Some((raw, raw));
                return None;
            }
            Some(window) => window,
        };

        if raw < lo {
            lo = raw;
        }
        if raw > hi {
            hi = raw;
        }
        if Some((lo, hi)) != self.window {
            self.window = Some((lo, hi));
            if hi > lo {
                self.cal_factor = RAW_RANGE as f32 / f32::from(hi - lo);
            }
        }

        (u32::from(hi - lo) >= self.min_span).then_some((lo, hi))
    }
}

impl core::fmt::Debug for AnalogControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnalogControl")
            .field("mapping", &self.mapping)
            .field("state", &self.state())
            .field("window", &self.window)
            .field("last_output", &self.last_output)
            .finish()
    }
}
