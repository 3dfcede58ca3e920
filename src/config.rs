use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 200;
pub const DEFAULT_REQUEST_LIFETIME_MS: u64 = 2000;
pub const DEFAULT_MAX_INBOUND_PER_TICK: usize = 10;
pub const DEFAULT_LEASE_SECONDS: u16 = 30;

/// Controller-wide configuration surface.
///
/// Loadable from JSON; unknown fields are rejected, missing fields fall back
/// to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Nominal control-loop period.
    pub tick_interval_ms: u64,
    /// Bound on inbound messages processed per tick so that a chatty device
    /// cannot starve the rest of the control loop.
    pub max_inbound_per_tick: usize,
    /// Lifetime of an outstanding request before it is treated as failed and
    /// the device is considered offline for that parameter.
    pub request_lifetime_ms: u64,
    /// Bidirectional lease duration; the handshake is renewed at half of it.
    pub lease_seconds: u16,
    /// Default switch LED brightness for the enabled state.
    pub led_brightness_on: f32,
    /// Default switch LED brightness for the disabled state.
    pub led_brightness_off: f32,
    /// Default display label dim factor for the enabled state.
    pub display_dim_on: f32,
    /// Default display label dim factor for the disabled state.
    pub display_dim_off: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_inbound_per_tick: DEFAULT_MAX_INBOUND_PER_TICK,
            request_lifetime_ms: DEFAULT_REQUEST_LIFETIME_MS,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            led_brightness_on: 0.3,
            led_brightness_off: 0.02,
            display_dim_on: 1.0,
            display_dim_off: 0.2,
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("tick_interval_ms must be > 0"));
        }
        if self.max_inbound_per_tick == 0 {
            return Err(ConfigError::InvalidValue("max_inbound_per_tick must be > 0"));
        }
        if self.request_lifetime_ms == 0 {
            return Err(ConfigError::InvalidValue("request_lifetime_ms must be > 0"));
        }
        if self.lease_seconds == 0 {
            return Err(ConfigError::InvalidValue("lease_seconds must be > 0"));
        }
        for (name, value) in [
            ("led_brightness_on", self.led_brightness_on),
            ("led_brightness_off", self.led_brightness_off),
            ("display_dim_on", self.display_dim_on),
            ("display_dim_off", self.display_dim_off),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration value: {0}")]
    InvalidValue(&'static str),
    #[error("configuration value out of [0..1] range: {0}")]
    OutOfRange(&'static str),
}
