use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{lipsync::SpectralProbe, AudioError, AudioErrorKind, Result};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    pub playback: PlaybackConfig,
    pub device: DeviceConfig,
}

impl EngineConfig {
    /// Parses a JSON document. Missing sections fall back to their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| {
            AudioError::new(AudioErrorKind::InvalidData, "malformed engine configuration")
                .with_cause(err)
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}

/// Configuration specific to the rendering context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate reported by the clocked host's context.
    pub sample_rate: u32,
    /// Output device name used by the hardware host. `None` picks the default.
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            output_device: None,
        }
    }
}

/// Tuning for the batch and streaming lip-sync analysis.
///
/// The window sizes and thresholds are empirical starting points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Window length used for clips shorter than `long_clip_seconds`.
    pub short_window_ms: u32,
    /// Window length used for long clips to bound the total work.
    pub long_window_ms: u32,
    pub long_clip_seconds: f32,
    /// Number of windows processed between cooperative yields.
    pub yield_every: usize,
    pub timeout_ms: u64,
    pub cache_capacity: usize,
    /// Windowed RMS below this value is treated as silence.
    pub silence_threshold: f32,
    pub spectral_probe: SpectralProbe,
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            short_window_ms: 20,
            long_window_ms: 50,
            long_clip_seconds: 12.0,
            yield_every: 64,
            timeout_ms: 10_000,
            cache_capacity: 32,
            silence_threshold: 0.01,
            spectral_probe: SpectralProbe::Variance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Animation callback rate while a clip is playing.
    pub tick_hz: u32,
    pub volume: f32,
    pub muted: bool,
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            volume: 1.0,
            muted: false,
        }
    }
}

/// Inputs to the device capability probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// User agent reported by the embedding shell, if any.
    pub user_agent: Option<String>,
    /// Forces the reset-before-reuse policy regardless of the detected class.
    pub force_reset_on_reuse: bool,
    /// The shell was launched with autoplay permitted, so audio may start
    /// without a user gesture.
    pub autoplay_allowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_use_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "analysis": { "timeout_ms": 250 } }"#).unwrap();
        assert_eq!(config.analysis.timeout(), Duration::from_millis(250));
        assert_eq!(config.analysis.short_window_ms, 20);
        assert_eq!(config.playback.tick_hz, 60);
        assert_eq!(config.audio.sample_rate, 48_000);
    }

    #[test]
    fn rejects_malformed_documents() {
        let err = EngineConfig::from_json_str("{ nope").unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::InvalidData);
    }

    #[test]
    fn parses_spectral_probe_names() {
        let config =
            EngineConfig::from_json_str(r#"{ "analysis": { "spectral_probe": "fft" } }"#).unwrap();
        assert_eq!(config.analysis.spectral_probe, SpectralProbe::Fft);
    }
}
