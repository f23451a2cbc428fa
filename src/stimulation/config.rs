use crate::rumble::{self, RumblePacket, DEFAULT_FREQ_HZ};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PULSE_MS: u64 = 300;
pub const MIN_PULSE_MS: u64 = 10;
pub const MAX_PULSE_MS: u64 = 2000;
pub const DEFAULT_AMPLITUDE: f64 = 0.5;

/// Whether a run repeats forever or for a fixed number of cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Unlimited,
    Count,
}

impl RepeatMode {
    /// Anything other than an explicit "count" means unlimited
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("count") {
            RepeatMode::Count
        } else {
            RepeatMode::Unlimited
        }
    }
}

/// Raw, untrusted stimulation parameters
///
/// This is what arrives from the command line, a settings file or a remote
/// caller. Missing or non-finite values fall back to defaults in
/// [`StimulationConfig::normalize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulationRequest {
    pub pulse_duration_ms: Option<f64>,
    pub amplitude: Option<f64>,
    pub pause_duration_ms: Option<f64>,
    pub repeat_mode: Option<String>,
    pub repeat_count: Option<f64>,
    pub low_freq_hz: Option<f64>,
    pub high_freq_hz: Option<f64>,
}

impl StimulationRequest {
    /// Initial values of the interactive app
    pub fn app_defaults() -> Self {
        Self {
            pulse_duration_ms: Some(500.0),
            amplitude: Some(0.5),
            pause_duration_ms: Some(800.0),
            repeat_mode: Some("unlimited".to_string()),
            repeat_count: Some(1.0),
            low_freq_hz: Some(DEFAULT_FREQ_HZ),
            high_freq_hz: Some(DEFAULT_FREQ_HZ),
        }
    }

    /// Fields set in `overrides` replace the ones in `self`
    pub fn merged_with(&self, overrides: &StimulationRequest) -> StimulationRequest {
        StimulationRequest {
            pulse_duration_ms: overrides.pulse_duration_ms.or(self.pulse_duration_ms),
            amplitude: overrides.amplitude.or(self.amplitude),
            pause_duration_ms: overrides.pause_duration_ms.or(self.pause_duration_ms),
            repeat_mode: overrides
                .repeat_mode
                .clone()
                .or_else(|| self.repeat_mode.clone()),
            repeat_count: overrides.repeat_count.or(self.repeat_count),
            low_freq_hz: overrides.low_freq_hz.or(self.low_freq_hz),
            high_freq_hz: overrides.high_freq_hz.or(self.high_freq_hz),
        }
    }
}

/// Normalized stimulation parameters
///
/// Every field is clamped once at construction; the scheduler never sees raw
/// caller input.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulationConfig {
    pulse_duration_ms: u64,
    amplitude: f64,
    pause_duration_ms: u64,
    repeat_mode: RepeatMode,
    repeat_count: u32,
    low_freq_hz: f64,
    high_freq_hz: f64,
}

fn finite_or(value: Option<f64>, fallback: f64) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(fallback)
}

impl StimulationConfig {
    pub fn normalize(request: &StimulationRequest) -> Self {
        let pulse = finite_or(request.pulse_duration_ms, DEFAULT_PULSE_MS as f64)
            .clamp(MIN_PULSE_MS as f64, MAX_PULSE_MS as f64);
        let pause = finite_or(request.pause_duration_ms, 0.0).max(0.0);
        let amplitude = finite_or(request.amplitude, DEFAULT_AMPLITUDE).clamp(0.0, 1.0);
        let repeat_count = finite_or(request.repeat_count, 1.0).floor().max(1.0);
        let repeat_mode = request
            .repeat_mode
            .as_deref()
            .map(RepeatMode::parse)
            .unwrap_or_default();

        Self {
            pulse_duration_ms: pulse.round() as u64,
            amplitude,
            pause_duration_ms: pause.round() as u64,
            repeat_mode,
            // `as` saturates, huge counts become u32::MAX
            repeat_count: repeat_count as u32,
            low_freq_hz: finite_or(request.low_freq_hz, DEFAULT_FREQ_HZ),
            high_freq_hz: finite_or(request.high_freq_hz, DEFAULT_FREQ_HZ),
        }
    }

    pub fn pulse_duration_ms(&self) -> u64 {
        self.pulse_duration_ms
    }

    pub fn pause_duration_ms(&self) -> u64 {
        self.pause_duration_ms
    }

    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_duration_ms)
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_millis(self.pause_duration_ms)
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn low_freq_hz(&self) -> f64 {
        self.low_freq_hz
    }

    pub fn high_freq_hz(&self) -> f64 {
        self.high_freq_hz
    }

    /// Number of cycles to run, `None` when unlimited
    pub fn cycle_limit(&self) -> Option<u32> {
        match self.repeat_mode {
            RepeatMode::Unlimited => None,
            RepeatMode::Count => Some(self.repeat_count),
        }
    }

    /// Rumble packet for one pulse of this configuration
    pub fn rumble_packet(&self) -> RumblePacket {
        rumble::encode(self.low_freq_hz, self.high_freq_hz, self.amplitude)
    }

    /// Back to the raw form, e.g. for persisting
    pub fn to_request(&self) -> StimulationRequest {
        StimulationRequest {
            pulse_duration_ms: Some(self.pulse_duration_ms as f64),
            amplitude: Some(self.amplitude),
            pause_duration_ms: Some(self.pause_duration_ms as f64),
            repeat_mode: Some(
                match self.repeat_mode {
                    RepeatMode::Unlimited => "unlimited",
                    RepeatMode::Count => "count",
                }
                .to_string(),
            ),
            repeat_count: Some(f64::from(self.repeat_count)),
            low_freq_hz: Some(self.low_freq_hz),
            high_freq_hz: Some(self.high_freq_hz),
        }
    }
}

impl Default for StimulationConfig {
    fn default() -> Self {
        Self::normalize(&StimulationRequest::default())
    }
}

impl From<StimulationRequest> for StimulationConfig {
    fn from(request: StimulationRequest) -> Self {
        Self::normalize(&request)
    }
}

impl From<&StimulationRequest> for StimulationConfig {
    fn from(request: &StimulationRequest) -> Self {
        Self::normalize(request)
    }
}
