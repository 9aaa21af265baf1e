//! Fixtures shared by unit tests.

use std::{f32::consts::PI, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    context::{AudioHost, DecodedAudio, HandleState, HostContext, TransportNode, TransportRequest},
    format::NormalizedAudio,
    AudioError, AudioErrorKind, Result,
};

/// Little RIFF/PCM16 writer.
pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Mono tone whose amplitude swells and fades twice a second, roughly the
/// envelope of syllables.
pub(crate) fn speech_like(seconds: f32, sample_rate: u32) -> Vec<f32> {
    let total = (seconds * sample_rate as f32) as usize;
    (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = (2.0 * PI * 2.0 * t).sin().abs();
            envelope * 0.6 * (2.0 * PI * 220.0 * t).sin()
        })
        .collect()
}

/// WAV clip of `seconds` of [`speech_like`] audio at 16 kHz.
pub(crate) fn speech_wav(seconds: f32) -> Vec<u8> {
    wav_bytes(&speech_like(seconds, 16_000), 16_000, 1)
}

/// Host whose contexts run but reject every buffer with a fixed error, or
/// which cannot create a context at all.
#[derive(Debug)]
pub(crate) struct RejectingHost {
    decode_error: AudioError,
    create_fails: bool,
}

impl RejectingHost {
    pub(crate) fn unsupported_codec() -> Self {
        Self {
            decode_error: AudioError::new(AudioErrorKind::FormatUnsupported, "unsupported codec"),
            create_fails: false,
        }
    }

    pub(crate) fn without_device() -> Self {
        Self {
            decode_error: AudioError::decode_failed("unreachable"),
            create_fails: true,
        }
    }
}

#[async_trait]
impl AudioHost for RejectingHost {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    async fn create_context(&self) -> Result<Arc<dyn HostContext>> {
        if self.create_fails {
            return Err(AudioError::initialization_failed("no output device"));
        }
        Ok(Arc::new(RejectingContext {
            decode_error: self.decode_error.clone(),
            state: Mutex::new(HandleState::Suspended),
        }))
    }
}

#[derive(Debug)]
struct RejectingContext {
    decode_error: AudioError,
    state: Mutex<HandleState>,
}

#[async_trait]
impl HostContext for RejectingContext {
    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn state(&self) -> HandleState {
        *self.state.lock()
    }

    async fn resume(&self) -> Result<()> {
        *self.state.lock() = HandleState::Running;
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        *self.state.lock() = HandleState::Suspended;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = HandleState::Closed;
        Ok(())
    }

    async fn decode(&self, _audio: NormalizedAudio) -> Result<DecodedAudio> {
        Err(self.decode_error.clone())
    }

    fn start_transport(&self, _request: TransportRequest) -> Result<Box<dyn TransportNode>> {
        Err(AudioError::playback_failed("nothing was decoded"))
    }
}
