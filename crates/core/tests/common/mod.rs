#![allow(dead_code)]

use std::f32::consts::PI;

use kiosk_voice_core::{EngineConfig, VoiceEngine};

/// RIFF/PCM16 encoder for synthetic fixtures.
pub fn wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Syllable-like clip: a voiced tone under a 2 Hz envelope with a burst of
/// high-frequency hiss every half second.
pub fn utterance(seconds: f32, sample_rate: u32) -> Vec<u8> {
    let total = (seconds * sample_rate as f32) as usize;
    let samples: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = (2.0 * PI * 2.0 * t).sin().abs();
            let voiced = 0.5 * (2.0 * PI * 180.0 * t).sin() + 0.2 * (2.0 * PI * 900.0 * t).sin();
            let hiss = if t.fract() > 0.45 && t.fract() < 0.5 {
                0.3 * (2.0 * PI * 5_500.0 * t).sin()
            } else {
                0.0
            };
            envelope * voiced + hiss
        })
        .collect();
    wav(&samples, sample_rate)
}

pub fn engine() -> VoiceEngine {
    VoiceEngine::clocked(EngineConfig::default())
}
