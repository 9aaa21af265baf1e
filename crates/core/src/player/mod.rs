//! Single-stream player.
//!
//! One decoded buffer at a time, played through single-use transport nodes
//! obtained from the shared rendering context. Position is tracked against a
//! wall-clock anchor rather than queried from the node.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{broadcast, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    context::{DecodedAudio, GainNode, HostContext, TransportNode, TransportRequest},
    format::{self, AudioInput, DetectedFormat},
    AudioError, AudioErrorKind, ContextManager, Result,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Loading,
    Loaded,
    Playing,
    Paused,
    Ended,
    Error,
}

/// What a successful [`Player::load`] learned about the clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadInfo {
    pub duration: f32,
    pub byte_len: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: DetectedFormat,
}

/// Transport notifications. `playback` identifies one run from a clean start
/// until it stops or ends; pausing and resuming keep the same id.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Started { playback: u64, offset: f32 },
    Paused { playback: u64, position: f32 },
    Stopped { playback: u64 },
    Ended { playback: u64 },
    Error { playback: u64, error: AudioError },
}

impl PlayerEvent {
    pub fn playback(&self) -> u64 {
        match self {
            Self::Started { playback, .. }
            | Self::Paused { playback, .. }
            | Self::Stopped { playback }
            | Self::Ended { playback }
            | Self::Error { playback, .. } => *playback,
        }
    }
}

/// Handle to a player. Clones drive the same player.
#[derive(Clone)]
pub struct Player {
    shared: Arc<PlayerShared>,
}

struct PlayerShared {
    manager: ContextManager,
    gain: Arc<GainNode>,
    events: broadcast::Sender<PlayerEvent>,
    core: Mutex<PlayerCore>,
}

struct PlayerCore {
    state: PlaybackState,
    buffer: Option<Arc<DecodedAudio>>,
    info: Option<LoadInfo>,
    transport: Option<Box<dyn TransportNode>>,
    /// Bumped for every transport node so stale end signals are ignored.
    generation: u64,
    playback: u64,
    offset: Duration,
    anchor: Option<Instant>,
}

impl Player {
    pub fn new(manager: ContextManager) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(manager, events, 1.0)
    }

    /// Player that publishes on an existing channel, starting at `volume`.
    pub fn with_events(
        manager: ContextManager,
        events: broadcast::Sender<PlayerEvent>,
        volume: f32,
    ) -> Self {
        Self {
            shared: Arc::new(PlayerShared {
                manager,
                gain: Arc::new(GainNode::new(volume)),
                events,
                core: Mutex::new(PlayerCore {
                    state: PlaybackState::Idle,
                    buffer: None,
                    info: None,
                    transport: None,
                    generation: 0,
                    playback: 0,
                    offset: Duration::ZERO,
                    anchor: None,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.core.lock().state
    }

    /// Id of the current (or most recent) playback run.
    pub fn playback_id(&self) -> u64 {
        self.shared.core.lock().playback
    }

    pub fn info(&self) -> Option<LoadInfo> {
        self.shared.core.lock().info.clone()
    }

    pub fn duration(&self) -> f32 {
        self.shared
            .core
            .lock()
            .buffer
            .as_ref()
            .map_or(0.0, |buffer| buffer.duration().as_secs_f32())
    }

    pub fn volume(&self) -> f32 {
        self.shared.gain.value()
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.gain.set_value(volume);
    }

    /// Decodes `input` and makes it the current buffer.
    pub async fn load(&self, input: &AudioInput) -> Result<LoadInfo> {
        {
            let mut core = self.shared.core.lock();
            self.halt_locked(&mut core);
            core.state = PlaybackState::Loading;
        }

        let normalized = match format::normalize(input) {
            Ok(normalized) => normalized,
            Err(err) => return Err(self.fail(err)),
        };
        if normalized.is_empty() {
            return Err(self.fail(AudioError::invalid_data("audio buffer is empty")));
        }

        let byte_len = normalized.len();
        let prefix = format::diagnostic_prefix(&normalized.bytes);
        let detected = normalized.detected;

        let decoded = match self.shared.manager.decode(normalized).await {
            Ok(decoded) => decoded,
            Err(err) => {
                let wrapped = AudioError::new(
                    err.kind,
                    format!("could not decode {byte_len} bytes starting with {prefix}"),
                )
                .with_cause(err);
                return Err(self.fail(wrapped));
            }
        };

        let info = LoadInfo {
            duration: decoded.duration().as_secs_f32(),
            byte_len,
            sample_rate: decoded.sample_rate,
            channels: decoded.channels,
            format: detected,
        };

        let mut core = self.shared.core.lock();
        core.buffer = Some(Arc::new(decoded));
        core.info = Some(info.clone());
        core.offset = Duration::ZERO;
        core.anchor = None;
        core.state = PlaybackState::Loaded;
        debug!(duration = info.duration, byte_len, "audio loaded");
        Ok(info)
    }

    /// Starts from the beginning, or resumes when paused. Calling it while
    /// already playing does nothing.
    pub async fn play(&self) -> Result<()> {
        let context = self.shared.manager.initialize().await?;

        let mut core = self.shared.core.lock();
        let offset = match core.state {
            PlaybackState::Playing => {
                debug!("play requested while already playing");
                return Ok(());
            }
            PlaybackState::Paused => core.offset,
            PlaybackState::Loaded | PlaybackState::Ended => {
                core.playback += 1;
                Duration::ZERO
            }
            PlaybackState::Idle | PlaybackState::Loading | PlaybackState::Error => {
                return Err(AudioError::playback_failed("no audio is loaded"));
            }
        };

        self.start_locked(&mut core, context.as_ref(), offset)
    }

    pub fn pause(&self) {
        let mut core = self.shared.core.lock();
        if core.state != PlaybackState::Playing {
            return;
        }

        let position = elapsed(&core);
        stop_transport(&mut core);
        core.offset = position;
        core.anchor = None;
        core.state = PlaybackState::Paused;
        self.emit(PlayerEvent::Paused {
            playback: core.playback,
            position: position.as_secs_f32(),
        });
    }

    /// Always safe. Returns to `loaded` when a buffer is present.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock();
        self.halt_locked(&mut core);
        core.offset = Duration::ZERO;
        core.anchor = None;
        if !matches!(core.state, PlaybackState::Loading) {
            core.state = if core.buffer.is_some() {
                PlaybackState::Loaded
            } else {
                PlaybackState::Idle
            };
        }
    }

    /// Moves the play head. Restarts the transport when playing; otherwise
    /// cues the position for the next [`play`](Self::play).
    pub async fn seek(&self, seconds: f32) -> Result<()> {
        let context = self.shared.manager.initialize().await?;

        let mut core = self.shared.core.lock();
        let duration = match core.buffer.as_ref() {
            Some(buffer) => buffer.duration(),
            None => return Err(AudioError::playback_failed("no audio is loaded")),
        };
        let target = Duration::from_secs_f32(seconds.max(0.0)).min(duration);

        match core.state {
            PlaybackState::Playing => self.start_locked(&mut core, context.as_ref(), target),
            PlaybackState::Loaded | PlaybackState::Ended => {
                core.playback += 1;
                core.offset = target;
                core.state = PlaybackState::Paused;
                Ok(())
            }
            PlaybackState::Paused => {
                core.offset = target;
                Ok(())
            }
            PlaybackState::Idle | PlaybackState::Loading | PlaybackState::Error => {
                Err(AudioError::playback_failed("no audio is loaded"))
            }
        }
    }

    /// Seconds into the clip.
    pub fn current_time(&self) -> f32 {
        let core = self.shared.core.lock();
        match core.state {
            PlaybackState::Playing => elapsed(&core).as_secs_f32(),
            PlaybackState::Paused => core.offset.as_secs_f32(),
            _ => 0.0,
        }
    }

    /// Drops the loaded buffer but keeps the context and gain. Used on
    /// devices whose decoder state degrades across repeated plays.
    pub fn reset(&self) {
        let mut core = self.shared.core.lock();
        self.halt_locked(&mut core);
        core.generation += 1;
        core.buffer = None;
        core.info = None;
        core.offset = Duration::ZERO;
        core.anchor = None;
        core.state = PlaybackState::Idle;
        debug!("player reset");
    }

    fn start_locked(
        &self,
        core: &mut PlayerCore,
        context: &dyn HostContext,
        offset: Duration,
    ) -> Result<()> {
        let Some(buffer) = core.buffer.clone() else {
            return Err(AudioError::playback_failed("no audio is loaded"));
        };

        stop_transport(core);
        core.generation += 1;
        let generation = core.generation;
        let (ended, ended_rx) = oneshot::channel();

        let transport = context.start_transport(TransportRequest {
            buffer,
            offset,
            gain: self.shared.gain.clone(),
            ended,
        });
        let transport = match transport {
            Ok(transport) => transport,
            Err(err) => {
                let err = AudioError::new(AudioErrorKind::PlaybackFailed, "could not start playback")
                    .with_cause(err);
                core.state = PlaybackState::Error;
                self.emit(PlayerEvent::Error {
                    playback: core.playback,
                    error: err.clone(),
                });
                return Err(err);
            }
        };

        let now = Instant::now();
        core.transport = Some(transport);
        core.anchor = Some(now.checked_sub(offset).unwrap_or(now));
        core.offset = offset;
        core.state = PlaybackState::Playing;
        self.emit(PlayerEvent::Started {
            playback: core.playback,
            offset: offset.as_secs_f32(),
        });

        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(watch_transport(weak, generation, ended_rx));
        Ok(())
    }

    /// Stops the transport, announcing `Stopped` when a run was live.
    fn halt_locked(&self, core: &mut PlayerCore) {
        let was_active = matches!(core.state, PlaybackState::Playing | PlaybackState::Paused);
        stop_transport(core);
        if was_active {
            self.emit(PlayerEvent::Stopped {
                playback: core.playback,
            });
        }
    }

    fn on_transport_ended(&self, generation: u64) {
        let mut core = self.shared.core.lock();
        if core.generation != generation || core.state != PlaybackState::Playing {
            return;
        }
        core.transport = None;
        core.offset = Duration::ZERO;
        core.anchor = None;
        core.state = PlaybackState::Ended;
        debug!(playback = core.playback, "playback ended");
        self.emit(PlayerEvent::Ended {
            playback: core.playback,
        });
    }

    fn fail(&self, err: AudioError) -> AudioError {
        let mut core = self.shared.core.lock();
        stop_transport(&mut core);
        core.buffer = None;
        core.info = None;
        core.state = PlaybackState::Error;
        warn!(%err, "player entered error state");
        self.emit(PlayerEvent::Error {
            playback: core.playback,
            error: err.clone(),
        });
        err
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }
}

async fn watch_transport(
    player: Weak<PlayerShared>,
    generation: u64,
    ended: oneshot::Receiver<()>,
) {
    if ended.await.is_ok() {
        if let Some(shared) = player.upgrade() {
            Player { shared }.on_transport_ended(generation);
        }
    }
}

fn stop_transport(core: &mut PlayerCore) {
    if let Some(mut transport) = core.transport.take() {
        if let Err(err) = transport.stop() {
            debug!(%err, "transport already stopped");
        }
    }
}

fn elapsed(core: &PlayerCore) -> Duration {
    let duration = core
        .buffer
        .as_ref()
        .map_or(Duration::ZERO, |buffer| buffer.duration());
    core.anchor
        .map_or(core.offset, |anchor| anchor.elapsed())
        .min(duration)
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Player")
            .field("state", &core.state)
            .field("playback", &core.playback)
            .field("offset", &core.offset)
            .field("volume", &self.shared.gain.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{speech_wav, RejectingHost};

    async fn running_player() -> Player {
        let manager = ContextManager::clocked(48_000);
        manager.initialize().await.unwrap();
        Player::new(manager)
    }

    #[tokio::test(start_paused = true)]
    async fn load_reports_clip_metadata() {
        let player = running_player().await;
        let info = player
            .load(&AudioInput::binary(speech_wav(1.5)))
            .await
            .unwrap();

        assert_eq!(info.format, DetectedFormat::Wav);
        assert_eq!(info.sample_rate, 16_000);
        assert!((info.duration - 1.5).abs() < 0.01);
        assert_eq!(player.state(), PlaybackState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_undecodable_input_fail_distinctly() {
        let player = running_player().await;

        let err = player.load(&AudioInput::binary(Vec::new())).await.unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::InvalidData);

        let err = player
            .load(&AudioInput::binary(vec![7u8; 512]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::DecodeFailed);
        assert!(err.message.contains("512 bytes"));
        assert_eq!(player.state(), PlaybackState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failures_keep_the_underlying_kind() {
        let player = Player::new(ContextManager::new(Arc::new(RejectingHost::unsupported_codec())));
        let err = player
            .load(&AudioInput::binary(speech_wav(0.5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::FormatUnsupported);
        assert!(err.message.contains("bytes starting with 52494646"));
        assert_eq!(player.state(), PlaybackState::Error);

        let player = Player::new(ContextManager::new(Arc::new(RejectingHost::without_device())));
        let err = player
            .load(&AudioInput::binary(speech_wav(0.5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::InitializationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn plays_to_the_end_and_can_restart() {
        let player = running_player().await;
        let mut events = player.subscribe();
        player.load(&AudioInput::binary(speech_wav(1.0))).await.unwrap();

        player.play().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Started { playback: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Ended { playback: 1 }));
        assert_eq!(player.state(), PlaybackState::Ended);
        assert_eq!(player.current_time(), 0.0);

        player.play().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Started { playback: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn play_while_playing_is_a_no_op() {
        let player = running_player().await;
        player.load(&AudioInput::binary(speech_wav(1.0))).await.unwrap();
        player.play().await.unwrap();
        player.play().await.unwrap();

        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.playback_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_keep_position() {
        let player = running_player().await;
        player.load(&AudioInput::binary(speech_wav(2.0))).await.unwrap();
        player.play().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        player.pause();
        assert_eq!(player.state(), PlaybackState::Paused);
        let paused_at = player.current_time();
        assert!((paused_at - 0.5).abs() < 0.02, "{paused_at}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(player.current_time(), paused_at);

        player.play().await.unwrap();
        assert_eq!(player.playback_id(), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((player.current_time() - 0.75).abs() < 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_stop_are_safe_in_any_state() {
        let player = running_player().await;
        player.pause();
        player.stop();
        assert_eq!(player.state(), PlaybackState::Idle);

        player.load(&AudioInput::binary(speech_wav(1.0))).await.unwrap();
        player.pause();
        assert_eq!(player.state(), PlaybackState::Loaded);

        player.play().await.unwrap();
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlaybackState::Loaded);
        assert_eq!(player.current_time(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_transport_does_not_report_end() {
        let player = running_player().await;
        let mut events = player.subscribe();
        player.load(&AudioInput::binary(speech_wav(0.5))).await.unwrap();
        player.play().await.unwrap();
        player.stop();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Stopped { playback: 1 }));
        assert!(events.try_recv().is_err());
        assert_eq!(player.state(), PlaybackState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_cues_and_restarts() {
        let player = running_player().await;
        player.load(&AudioInput::binary(speech_wav(3.0))).await.unwrap();

        player.seek(1.0).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!((player.current_time() - 1.0).abs() < 1e-3);

        player.play().await.unwrap();
        player.seek(2.5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!((player.current_time() - 2.6).abs() < 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_keeps_gain_but_drops_the_buffer() {
        let player = running_player().await;
        player.set_volume(0.4);
        player.load(&AudioInput::binary(speech_wav(1.0))).await.unwrap();
        player.play().await.unwrap();

        player.reset();
        assert_eq!(player.state(), PlaybackState::Idle);
        assert_eq!(player.duration(), 0.0);
        assert_eq!(player.volume(), 0.4);
        assert!(player.play().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_live_clip_reports_it_stopped() {
        let player = running_player().await;
        let mut events = player.subscribe();
        player.load(&AudioInput::binary(speech_wav(2.0))).await.unwrap();
        player.play().await.unwrap();

        player.reset();
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Started { playback: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Stopped { playback: 1 }));

        player.load(&AudioInput::binary(speech_wav(2.0))).await.unwrap();
        player.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        player.pause();
        player.load(&AudioInput::binary(speech_wav(1.0))).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Started { playback: 2, .. }));
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Paused { playback: 2, .. }));
        assert!(matches!(events.recv().await.unwrap(), PlayerEvent::Stopped { playback: 2 }));

        player.reset();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn play_without_load_fails_cleanly() {
        let player = running_player().await;
        let err = player.play().await.unwrap_err();
        assert_eq!(err.kind, AudioErrorKind::PlaybackFailed);
    }
}
