//! Device-aware wrapper around the single-stream player.
//!
//! There is one playback strategy, the audio graph. Platform quirks only
//! decide whether the player is reset before it is reused.

mod device;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use device::{Capabilities, DeviceClass, DeviceProfile, Platform};

use crate::{
    gate::InteractionGate,
    player::{LoadInfo, PlaybackState, Player, PlayerEvent},
    queue::VolumeControl,
    AudioError, AudioErrorKind, AudioInput, ContextManager, Result,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackMethod {
    AudioGraph,
}

/// Outcome of an orchestrated operation. Failures are reported here rather
/// than returned as `Err`.
#[derive(Debug, Clone)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<AudioError>,
    pub method: PlaybackMethod,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            method: PlaybackMethod::AudioGraph,
        }
    }

    pub fn failed(error: AudioError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            method: PlaybackMethod::AudioGraph,
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failed(err),
        }
    }

    /// True when the failure clears after a user gesture.
    pub fn requires_interaction(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(AudioError::is_interaction_required)
    }

    pub fn into_result(self) -> Result<Option<T>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

/// Cheap to clone; clones drive the same player.
#[derive(Clone)]
pub struct PlaybackOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    manager: ContextManager,
    gate: InteractionGate,
    volume: Arc<VolumeControl>,
    profile: DeviceProfile,
    events: broadcast::Sender<PlayerEvent>,
    player: Mutex<Option<Player>>,
}

impl PlaybackOrchestrator {
    pub fn new(
        manager: ContextManager,
        gate: InteractionGate,
        volume: Arc<VolumeControl>,
        profile: DeviceProfile,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(class = ?profile.class, platform = ?profile.platform, "playback orchestrator ready");
        Self {
            inner: Arc::new(OrchestratorInner {
                manager,
                gate,
                volume,
                profile,
                events,
                player: Mutex::new(None),
            }),
        }
    }

    pub fn device_profile(&self) -> DeviceProfile {
        self.inner.profile
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.profile.capabilities
    }

    pub fn gate(&self) -> &InteractionGate {
        &self.inner.gate
    }

    pub fn manager(&self) -> &ContextManager {
        &self.inner.manager
    }

    /// Events from every player this orchestrator constructs.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    /// Loads `input` and starts it. Fails with `interaction-required` when
    /// no gesture has unlocked audio yet.
    pub async fn play_audio(&self, input: &AudioInput) -> OperationResult<LoadInfo> {
        OperationResult::from_result(self.try_play(input).await)
    }

    /// Like [`play_audio`](Self::play_audio) but waits for the first gesture
    /// instead of failing.
    pub async fn play_audio_when_ready(&self, input: &AudioInput) -> OperationResult<LoadInfo> {
        if self.needs_gesture() {
            let gate = &self.inner.gate;
            gate.request_interaction();
            debug!("waiting for user interaction before playback");
            gate.wait_until_ready().await;
        }
        self.play_audio(input).await
    }

    /// True while this device still blocks audio behind a user gesture.
    pub fn needs_gesture(&self) -> bool {
        self.inner.profile.capabilities.is_constrained_autoplay && !self.inner.gate.is_ready()
    }

    async fn try_play(&self, input: &AudioInput) -> Result<LoadInfo> {
        let capabilities = self.inner.profile.capabilities;
        if !capabilities.supports_required_decode {
            return Err(AudioError::new(
                AudioErrorKind::FormatUnsupported,
                "this device cannot decode audio for the audio graph",
            ));
        }
        if capabilities.is_constrained_autoplay {
            self.inner.gate.ensure_context().await?;
        } else {
            self.inner.manager.ensure_resumed().await?;
        }

        let player = self.prepare_player();
        let info = player.load(input).await?;
        player.play().await?;
        debug!(duration = info.duration, format = ?info.format, "playback started");
        Ok(info)
    }

    fn prepare_player(&self) -> Player {
        let mut slot = self.inner.player.lock();
        match slot.as_ref() {
            Some(player) => {
                if self.inner.profile.capabilities.needs_state_reset_on_reuse {
                    debug!("resetting player before reuse");
                    player.reset();
                } else {
                    player.stop();
                }
                player.set_volume(self.inner.volume.effective_volume());
                player.clone()
            }
            None => {
                let player = Player::with_events(
                    self.inner.manager.clone(),
                    self.inner.events.clone(),
                    self.inner.volume.effective_volume(),
                );
                *slot = Some(player.clone());
                player
            }
        }
    }

    fn player(&self) -> Option<Player> {
        self.inner.player.lock().clone()
    }

    pub async fn resume(&self) -> OperationResult<()> {
        let result = match self.player() {
            Some(player) => player.play().await,
            None => Err(AudioError::playback_failed("nothing has been loaded")),
        };
        if let Err(err) = &result {
            warn!(%err, "resume failed");
        }
        OperationResult::from_result(result)
    }

    pub fn pause(&self) {
        if let Some(player) = self.player() {
            player.pause();
        }
    }

    pub fn stop(&self) {
        if let Some(player) = self.player() {
            player.stop();
        }
    }

    pub async fn seek(&self, seconds: f32) -> OperationResult<()> {
        match self.player() {
            Some(player) => OperationResult::from_result(player.seek(seconds).await),
            None => OperationResult::failed(AudioError::playback_failed("nothing has been loaded")),
        }
    }

    /// Adjusts the current clip only. Every new clip starts at the level of
    /// the shared [`VolumeControl`].
    pub fn set_volume(&self, volume: f32) {
        if let Some(player) = self.player() {
            player.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.player()
            .map_or_else(|| self.inner.volume.effective_volume(), |player| player.volume())
    }

    pub fn current_time(&self) -> f32 {
        self.player().map_or(0.0, |player| player.current_time())
    }

    pub fn duration(&self) -> f32 {
        self.player().map_or(0.0, |player| player.duration())
    }

    pub fn state(&self) -> PlaybackState {
        self.player()
            .map_or(PlaybackState::Idle, |player| player.state())
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }
}

impl std::fmt::Debug for PlaybackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackOrchestrator")
            .field("profile", &self.inner.profile)
            .field("state", &self.state())
            .finish()
    }
}
