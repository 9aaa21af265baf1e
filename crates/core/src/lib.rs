//! Core library for the kiosk speech engine.
//!
//! Speech audio arrives as base64 text, raw bytes, or a typed blob. The crate
//! decodes it through one shared rendering context, plays it one utterance at
//! a time, and drives mouth-shape callbacks in step with playback. Audio stays
//! locked until the first user gesture reaches the [`InteractionGate`].

pub mod config;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod format;
pub mod gate;
pub mod lipsync;
pub mod orchestrator;
pub mod player;
pub mod queue;

#[cfg(test)]
mod test_support;

pub use config::{AnalysisConfig, AudioConfig, DeviceConfig, EngineConfig, PlaybackConfig};
pub use context::{AudioHost, ClockedHost, ContextManager, ContextState, DecodedAudio, HostContext};
#[cfg(feature = "hardware-audio")]
pub use context::DeviceHost;
pub use coordinator::{LipSyncOptions, LipSyncPlayer, PlaybackSummary};
pub use engine::VoiceEngine;
pub use error::{AudioError, AudioErrorKind, Result};
pub use format::{detect_format, is_valid_encoded_text, normalize, AudioInput, DetectedFormat};
pub use gate::{GateEvent, GestureEvent, GestureKind, InteractionGate};
pub use lipsync::{
    AnalysisCache, CacheStats, ContentFingerprint, LipSyncAnalyzer, LipSyncResult, LiveInput,
    MouthShape, SpectralProbe, VisemeFrame,
};
pub use orchestrator::{DeviceProfile, OperationResult, PlaybackMethod, PlaybackOrchestrator};
pub use player::{LoadInfo, PlaybackState, Player, PlayerEvent};
pub use queue::{AudioQueue, QueueEvent, UtteranceTicket, VolumeControl};
