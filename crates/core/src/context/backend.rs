use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{format::NormalizedAudio, Result};

/// Lifecycle of a single host context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Running,
    Suspended,
    Closed,
}

/// PCM produced by a decode, interleaved `f32` in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Channel-averaged copy of the waveform.
    pub fn mono(&self) -> Vec<f32> {
        let channels = usize::from(self.channels.max(1));
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Output gain shared between a player and the transport nodes it spawns.
///
/// Stored as the bit pattern of an `f32` so render loops can read it without
/// taking a lock.
#[derive(Debug)]
pub struct GainNode {
    bits: AtomicU32,
}

impl GainNode {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.clamp(0.0, 1.0).to_bits()),
        }
    }

    #[inline]
    pub fn value(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_value(&self, value: f32) {
        self.bits
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Default for GainNode {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Everything a host needs to start one transport node.
pub struct TransportRequest {
    pub buffer: Arc<DecodedAudio>,
    /// Position in the buffer where rendering begins.
    pub offset: Duration,
    pub gain: Arc<GainNode>,
    /// Fired once if, and only if, the node plays through to the end.
    pub ended: oneshot::Sender<()>,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("duration", &self.buffer.duration())
            .field("offset", &self.offset)
            .field("gain", &self.gain.value())
            .finish()
    }
}

/// Single-use playable node. There is no way to restart one: every play
/// after a stop or an end asks the context for a fresh node.
pub trait TransportNode: Send + fmt::Debug {
    /// Stops rendering. Stopping an already finished node is a no-op.
    fn stop(&mut self) -> Result<()>;

    fn is_finished(&self) -> bool;
}

/// The process-wide audio graph handle.
#[async_trait]
pub trait HostContext: Send + Sync + fmt::Debug {
    fn sample_rate(&self) -> u32;

    fn state(&self) -> HandleState;

    async fn resume(&self) -> Result<()>;

    async fn suspend(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Decodes a container into PCM. Works on a suspended context.
    async fn decode(&self, audio: NormalizedAudio) -> Result<DecodedAudio>;

    /// Starts a new transport node. Fails unless the context is running.
    fn start_transport(&self, request: TransportRequest) -> Result<Box<dyn TransportNode>>;
}

/// Factory for [`HostContext`] handles.
#[async_trait]
pub trait AudioHost: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Creates a new handle in the suspended state.
    async fn create_context(&self) -> Result<Arc<dyn HostContext>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_averages_interleaved_channels() {
        let audio = DecodedAudio {
            sample_rate: 2,
            channels: 2,
            samples: vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0],
        };
        assert_eq!(audio.frames(), 3);
        assert_eq!(audio.mono(), vec![0.5, 0.5, 0.0]);
        assert_eq!(audio.duration(), Duration::from_millis(1500));
    }

    #[test]
    fn gain_is_clamped() {
        let gain = GainNode::new(3.0);
        assert_eq!(gain.value(), 1.0);
        gain.set_value(-1.0);
        assert_eq!(gain.value(), 0.0);
        gain.set_value(0.25);
        assert_eq!(gain.value(), 0.25);
    }
}
