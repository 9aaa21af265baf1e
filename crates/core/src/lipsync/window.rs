use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use super::MouthShape;
use crate::{AudioError, Result};

/// RMS that maps to a fully open mouth.
const FULL_OPEN_RMS: f32 = 0.25;
/// Openness under which a voiced window still reads as closed lips.
const CLOSED_OPENNESS: f32 = 0.15;
const WIDE_OPENNESS: f32 = 0.6;

/// How the brightness of a window is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectralProbe {
    /// First-difference variance against signal variance. Cheap.
    #[default]
    Variance,
    /// Normalised spectral centroid of a Hann-windowed FFT.
    Fft,
}

impl SpectralProbe {
    /// Brightness below which a voiced window is classified as rounded.
    fn round_below(self) -> f32 {
        match self {
            Self::Variance => 0.02,
            Self::Fft => 0.08,
        }
    }

    /// Brightness above which a window is classified as a fricative.
    fn fricative_above(self) -> f32 {
        match self {
            Self::Variance => 0.30,
            Self::Fft => 0.45,
        }
    }
}

/// Features of one analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowFeatures {
    pub rms: f32,
    /// 0 for a dark, low-frequency window; 1 for energy at Nyquist.
    pub brightness: f32,
}

/// Per-window feature extraction. Keeps the FFT plan while the window
/// length stays the same.
pub(crate) struct FeatureExtractor {
    probe: SpectralProbe,
    fft: Option<FftResources>,
}

impl FeatureExtractor {
    pub(crate) fn new(probe: SpectralProbe) -> Self {
        Self {
            probe,
            fft: None,
        }
    }

    pub(crate) fn measure(&mut self, window: &[f32]) -> Result<WindowFeatures> {
        if window.len() < 2 {
            return Ok(WindowFeatures::default());
        }

        let rms = compute_rms(window);
        let brightness = match self.probe {
            SpectralProbe::Variance => variance_brightness(window),
            SpectralProbe::Fft => self.spectral_centroid(window)?,
        };
        Ok(WindowFeatures { rms, brightness })
    }

    fn spectral_centroid(&mut self, window: &[f32]) -> Result<f32> {
        let len = window.len();
        if self.fft.as_ref().map_or(true, |fft| fft.size != len) {
            let plan = RealFftPlanner::<f32>::new().plan_fft_forward(len);
            self.fft = Some(FftResources {
                size: len,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            });
        }
        let Some(fft) = self.fft.as_mut() else {
            return Ok(0.0);
        };

        for (index, (slot, value)) in fft.input.iter_mut().zip(window).enumerate() {
            *slot = *value * hann_value(index, len);
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| AudioError::invalid_data("spectral probe failed").with_cause(err))?;

        let mut magnitude_sum = 0.0;
        let mut weighted_sum = 0.0;
        for (bin, value) in fft.spectrum.iter().enumerate() {
            let magnitude = value.norm();
            magnitude_sum += magnitude;
            weighted_sum += magnitude * bin as f32;
        }

        if magnitude_sum <= f32::EPSILON {
            return Ok(0.0);
        }
        let nyquist_bin = (len / 2).max(1) as f32;
        Ok((weighted_sum / magnitude_sum / nyquist_bin).clamp(0.0, 1.0))
    }
}

impl fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("probe", &self.probe)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

/// Maps window features to a mouth shape and an openness level in `[0, 1]`.
pub fn classify(
    features: WindowFeatures,
    probe: SpectralProbe,
    silence_threshold: f32,
) -> (MouthShape, f32) {
    if features.rms < silence_threshold {
        return (MouthShape::Rest, 0.0);
    }

    let open = (features.rms / FULL_OPEN_RMS).clamp(0.0, 1.0);
    let shape = if open < CLOSED_OPENNESS {
        MouthShape::Closed
    } else if features.brightness > probe.fricative_above() {
        MouthShape::Fricative
    } else if features.brightness < probe.round_below() {
        MouthShape::Round
    } else if open > WIDE_OPENNESS {
        MouthShape::Open
    } else {
        MouthShape::Narrow
    };
    (shape, open)
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// For a sinusoid the ratio is `2 * (1 - cos w)`, so dividing by four puts
/// Nyquist at 1.
fn variance_brightness(samples: &[f32]) -> f32 {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let variance =
        samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / samples.len() as f32;
    if variance <= f32::EPSILON {
        return 0.0;
    }

    let diffs = samples.len() - 1;
    let diff_mean = samples.windows(2).map(|w| w[1] - w[0]).sum::<f32>() / diffs as f32;
    let diff_variance = samples
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0] - diff_mean;
            d * d
        })
        .sum::<f32>()
        / diffs as f32;

    (diff_variance / variance / 4.0).clamp(0.0, 1.0)
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
