//! Playback with synchronized mouth animation.
//!
//! [`LipSyncPlayer::play_with_lip_sync`] starts analysis and playback side by
//! side, drives the viseme callback once per animation tick while the clip
//! plays, and resolves when the transport has ended.

mod clock;
mod settle;

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

pub use clock::AnimationClock;
pub use settle::SettleGuard;

use crate::{
    format,
    lipsync::{LipSyncAnalyzer, LipSyncResult, MouthShape},
    orchestrator::{OperationResult, PlaybackOrchestrator},
    player::{PlaybackState, PlayerEvent},
    AudioError, AudioInput, Result,
};

pub type VisemeCallback = Arc<dyn Fn(MouthShape, f32) + Send + Sync>;
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&AudioError) + Send + Sync>;

/// Per-utterance options.
#[derive(Clone, Default)]
pub struct LipSyncOptions {
    lip_sync: bool,
    analysis_timeout: Option<Duration>,
    wait_for_interaction: bool,
    on_viseme: Option<VisemeCallback>,
    on_play: Option<LifecycleCallback>,
    on_pause: Option<LifecycleCallback>,
    on_ended: Option<LifecycleCallback>,
    on_error: Option<ErrorCallback>,
}

impl LipSyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lip_sync(mut self, enabled: bool) -> Self {
        self.lip_sync = enabled;
        self
    }

    pub fn analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = Some(timeout);
        self
    }

    /// Wait for the first user gesture instead of failing with
    /// `interaction-required`.
    pub fn wait_for_interaction(mut self, wait: bool) -> Self {
        self.wait_for_interaction = wait;
        self
    }

    pub fn on_viseme(mut self, callback: impl Fn(MouthShape, f32) + Send + Sync + 'static) -> Self {
        self.on_viseme = Some(Arc::new(callback));
        self
    }

    pub fn on_play(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_play = Some(Arc::new(callback));
        self
    }

    pub fn on_pause(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_pause = Some(Arc::new(callback));
        self
    }

    pub fn on_ended(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ended = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&AudioError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn lip_sync_enabled(&self) -> bool {
        self.lip_sync
    }

    fn viseme(&self, shape: MouthShape, open: f32) {
        if let Some(callback) = &self.on_viseme {
            callback(shape, open);
        }
    }

    fn played(&self) {
        if let Some(callback) = &self.on_play {
            callback();
        }
    }

    fn paused(&self) {
        if let Some(callback) = &self.on_pause {
            callback();
        }
    }

    fn ended(&self) {
        if let Some(callback) = &self.on_ended {
            callback();
        }
    }

    fn failed(&self, error: &AudioError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }
}

impl fmt::Debug for LipSyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LipSyncOptions")
            .field("lip_sync", &self.lip_sync)
            .field("analysis_timeout", &self.analysis_timeout)
            .field("wait_for_interaction", &self.wait_for_interaction)
            .field("on_viseme", &self.on_viseme.is_some())
            .finish()
    }
}

/// What happened during one utterance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackSummary {
    pub playback_id: u64,
    pub duration: f32,
    pub frames_emitted: u64,
    /// True when at least one analysed frame reached the viseme callback.
    pub animated: bool,
    /// True when the utterance was stopped before it ended.
    pub interrupted: bool,
}

type Completion = SettleGuard<Result<PlaybackSummary>>;

/// Cheap to clone; clones share the orchestrator and analyzer.
#[derive(Clone)]
pub struct LipSyncPlayer {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    orchestrator: PlaybackOrchestrator,
    analyzer: LipSyncAnalyzer,
    tick: Duration,
    active: Mutex<Option<Completion>>,
}

impl LipSyncPlayer {
    pub fn new(orchestrator: PlaybackOrchestrator, analyzer: LipSyncAnalyzer, tick: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                orchestrator,
                analyzer,
                tick,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn orchestrator(&self) -> &PlaybackOrchestrator {
        &self.inner.orchestrator
    }

    pub fn analyzer(&self) -> &LipSyncAnalyzer {
        &self.inner.analyzer
    }

    /// Plays `input` and animates it when lip sync is requested. Analysis
    /// failures only cost the animation; playback failures fail the call.
    pub async fn play_with_lip_sync(
        &self,
        input: &AudioInput,
        options: LipSyncOptions,
    ) -> OperationResult<PlaybackSummary> {
        let (completion, settled) = SettleGuard::new();
        self.inner.active.lock().replace(completion.clone());

        let (analysis, analysis_task) = self.start_analysis(input, &options);
        let events = self.inner.orchestrator.subscribe();
        let driver = tokio::spawn(drive(
            events,
            analysis,
            options.clone(),
            self.inner.tick,
            completion.clone(),
        ));

        let mut settled = settled;
        let mut early = None;
        if options.wait_for_interaction && self.inner.orchestrator.needs_gesture() {
            let gate = self.inner.orchestrator.gate();
            gate.request_interaction();
            debug!("utterance waiting for user interaction");
            tokio::select! {
                _ = gate.wait_until_ready() => {}
                outcome = &mut settled => early = Some(outcome),
            }
        }

        let mut duration = 0.0;
        if early.is_none() && !completion.is_settled() {
            match self.inner.orchestrator.play_audio(input).await.into_result() {
                Ok(info) => duration = info.map_or(0.0, |info| info.duration),
                Err(err) => {
                    options.failed(&err);
                    completion.settle(Err(err));
                }
            }
            if completion.is_settled() && self.inner.orchestrator.is_playing() {
                // Interrupted while loading; do not leave the clip running.
                self.inner.orchestrator.stop();
            }
        }

        let outcome = match early {
            Some(outcome) => outcome,
            None => settled.await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(AudioError::playback_failed("playback driver went away")),
        };

        driver.abort();
        if let Some(task) = analysis_task {
            task.abort();
        }
        {
            let mut active = self.inner.active.lock();
            if active.as_ref().is_some_and(SettleGuard::is_settled) {
                active.take();
            }
        }

        OperationResult::from_result(outcome.map(|summary| PlaybackSummary {
            duration,
            ..summary
        }))
    }

    /// Playback without analysis.
    pub async fn play_fast(
        &self,
        input: &AudioInput,
        options: LipSyncOptions,
    ) -> OperationResult<PlaybackSummary> {
        self.play_with_lip_sync(input, options.with_lip_sync(false))
            .await
    }

    /// Interrupts the current utterance. Its pending call resolves with
    /// `interrupted` set.
    pub fn stop(&self) {
        let was_active = matches!(
            self.inner.orchestrator.state(),
            PlaybackState::Playing | PlaybackState::Paused
        );
        self.inner.orchestrator.stop();

        if !was_active {
            if let Some(completion) = self.inner.active.lock().as_ref() {
                completion.settle(Ok(PlaybackSummary {
                    interrupted: true,
                    ..PlaybackSummary::default()
                }));
            }
        }
    }

    fn start_analysis(
        &self,
        input: &AudioInput,
        options: &LipSyncOptions,
    ) -> (
        watch::Receiver<Option<Arc<LipSyncResult>>>,
        Option<JoinHandle<()>>,
    ) {
        let (publish, frames) = watch::channel(None);
        if !options.lip_sync {
            return (frames, None);
        }

        let binary = match binary_input(input) {
            Ok(binary) => binary,
            Err(err) => {
                warn!(%err, "lip-sync skipped; input could not be converted");
                return (frames, None);
            }
        };

        let analyzer = self.inner.analyzer.clone();
        let timeout = options
            .analysis_timeout
            .unwrap_or_else(|| analyzer.config().timeout());
        let task = tokio::spawn(async move {
            match analyzer.analyze_with_timeout(&binary, timeout).await {
                Ok(result) => {
                    debug!(frames = result.len(), "lip-sync frames ready");
                    let _ = publish.send(Some(result));
                }
                Err(err) => warn!(%err, "lip-sync analysis failed; playing without animation"),
            }
        });
        (frames, Some(task))
    }
}

impl fmt::Debug for LipSyncPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LipSyncPlayer")
            .field("orchestrator", &self.inner.orchestrator)
            .field("tick", &self.inner.tick)
            .finish()
    }
}

fn binary_input(input: &AudioInput) -> Result<AudioInput> {
    if input.is_text() {
        let normalized = format::normalize(input)?;
        return Ok(AudioInput::binary(normalized.bytes));
    }
    Ok(input.clone())
}

/// Follows one playback run: anchors the animation clock on "started",
/// emits a viseme per tick, and settles on the terminal event.
async fn drive(
    mut events: broadcast::Receiver<PlayerEvent>,
    analysis: watch::Receiver<Option<Arc<LipSyncResult>>>,
    options: LipSyncOptions,
    tick: Duration,
    completion: Completion,
) {
    let animate = options.lip_sync && options.on_viseme.is_some();
    let mut clock = AnimationClock::default();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ours: Option<u64> = None;
    let mut summary = PlaybackSummary::default();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "animation driver lagged behind player events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        completion.settle(Err(AudioError::playback_failed("player event stream closed")));
                        return;
                    }
                };

                let Some(playback) = ours else {
                    // Anything before our first start belongs to an earlier run.
                    if let PlayerEvent::Started { playback, offset } = event {
                        ours = Some(playback);
                        summary.playback_id = playback;
                        clock.start(offset);
                        options.played();
                    }
                    continue;
                };
                if event.playback() != playback {
                    continue;
                }

                match event {
                    PlayerEvent::Started { offset, .. } => clock.start(offset),
                    PlayerEvent::Paused { position, .. } => {
                        clock.pause_at(position);
                        options.paused();
                    }
                    PlayerEvent::Ended { .. } => {
                        options.viseme(MouthShape::Closed, 0.0);
                        options.ended();
                        completion.settle(Ok(summary));
                        return;
                    }
                    PlayerEvent::Stopped { .. } => {
                        options.viseme(MouthShape::Closed, 0.0);
                        summary.interrupted = true;
                        completion.settle(Ok(summary));
                        return;
                    }
                    PlayerEvent::Error { error, .. } => {
                        options.viseme(MouthShape::Closed, 0.0);
                        options.failed(&error);
                        completion.settle(Err(error));
                        return;
                    }
                }
            }
            _ = ticker.tick(), if animate && clock.is_running() => {
                let frames = analysis.borrow().clone();
                if let Some(frames) = frames {
                    let frame = frames.frame_at(clock.elapsed());
                    options.viseme(frame.shape, frame.open);
                    summary.frames_emitted += 1;
                    summary.animated = true;
                }
            }
        }

        if completion.is_settled() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::{AnalysisConfig, PlaybackConfig},
        gate::{GestureEvent, GestureKind, InteractionGate},
        orchestrator::DeviceProfile,
        queue::VolumeControl,
        test_support::speech_wav,
        AudioErrorKind, ContextManager,
    };

    async fn coordinator() -> LipSyncPlayer {
        coordinator_on(DeviceProfile::host()).await
    }

    async fn coordinator_on(profile: DeviceProfile) -> LipSyncPlayer {
        let manager = ContextManager::clocked(48_000);
        let gate = InteractionGate::new(manager.clone());
        gate.handle_gesture(GestureEvent::trusted(GestureKind::Click))
            .await
            .unwrap();
        let orchestrator = PlaybackOrchestrator::new(
            manager.clone(),
            gate,
            Arc::new(VolumeControl::default()),
            profile,
        );
        let analyzer = LipSyncAnalyzer::new(manager, AnalysisConfig::default());
        LipSyncPlayer::new(orchestrator, analyzer, PlaybackConfig::default().tick_interval())
    }

    #[tokio::test(start_paused = true)]
    async fn animates_until_the_clip_ends() {
        let player = coordinator().await;
        let shapes = Arc::new(Mutex::new(Vec::new()));
        let ended = Arc::new(AtomicUsize::new(0));

        let (seen, ends) = (shapes.clone(), ended.clone());
        let options = LipSyncOptions::new()
            .with_lip_sync(true)
            .on_viseme(move |shape, open| seen.lock().push((shape, open)))
            .on_ended(move || {
                ends.fetch_add(1, Ordering::SeqCst);
            });

        let result = player
            .play_with_lip_sync(&AudioInput::binary(speech_wav(1.0)), options)
            .await;
        let summary = result.data.unwrap();

        assert!(!summary.interrupted);
        assert!((summary.duration - 1.0).abs() < 0.01);
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        let shapes = shapes.lock();
        assert_eq!(shapes.last(), Some(&(MouthShape::Closed, 0.0)));
        if summary.animated {
            assert_eq!(shapes.len() as u64, summary.frames_emitted + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_input_is_analysed_as_binary() {
        let player = coordinator().await;
        let text = format::encode_text(&speech_wav(0.5));
        let result = player
            .play_with_lip_sync(
                &AudioInput::text(text),
                LipSyncOptions::new().with_lip_sync(true).on_viseme(|_, _| {}),
            )
            .await;

        assert!(result.success);
        tokio::task::yield_now().await;
        assert!(player.analyzer().analysis_runs() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_path_skips_analysis() {
        let player = coordinator().await;
        let visemes = Arc::new(AtomicUsize::new(0));
        let counter = visemes.clone();

        let result = player
            .play_fast(
                &AudioInput::binary(speech_wav(0.5)),
                LipSyncOptions::new().on_viseme(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        let summary = result.data.unwrap();
        assert!(!summary.animated);
        assert_eq!(summary.frames_emitted, 0);
        assert_eq!(player.analyzer().analysis_runs(), 0);
        // Only the closing frame.
        assert_eq!(visemes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_failure_still_plays() {
        let player = coordinator().await;
        let result = player
            .play_with_lip_sync(
                &AudioInput::binary(speech_wav(0.5)),
                LipSyncOptions::new()
                    .with_lip_sync(true)
                    .analysis_timeout(Duration::ZERO)
                    .on_viseme(|_, _| {}),
            )
            .await;

        assert!(result.success);
        assert!(!result.data.unwrap().animated);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failure_settles_once_with_error() {
        let player = coordinator().await;
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();

        let result = player
            .play_with_lip_sync(
                &AudioInput::binary(vec![9u8; 128]),
                LipSyncOptions::new()
                    .with_lip_sync(true)
                    .on_error(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, AudioErrorKind::DecodeFailed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_current_utterance() {
        let player = coordinator().await;
        let playing = player.clone();
        let task = tokio::spawn(async move {
            playing
                .play_with_lip_sync(&AudioInput::binary(speech_wav(5.0)), LipSyncOptions::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        player.stop();
        let summary = task.await.unwrap().data.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.playback_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_keep_the_same_utterance() {
        let player = coordinator().await;
        let pauses = Arc::new(AtomicUsize::new(0));
        let counter = pauses.clone();
        let playing = player.clone();
        let task = tokio::spawn(async move {
            playing
                .play_with_lip_sync(
                    &AudioInput::binary(speech_wav(1.0)),
                    LipSyncOptions::new().on_pause(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        player.orchestrator().pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!task.is_finished());
        assert!(player.orchestrator().resume().await.success);

        let summary = task.await.unwrap().data.unwrap();
        assert!(!summary.interrupted);
        assert_eq!(summary.playback_id, 1);
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_replaced_clip_settles_on_tablets() {
        let player =
            coordinator_on(DeviceProfile::from_user_agent("Mozilla/5.0 (iPad; CPU OS 16_5)")).await;
        let first = player.clone();
        let task = tokio::spawn(async move {
            first
                .play_with_lip_sync(&AudioInput::binary(speech_wav(2.0)), LipSyncOptions::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = player
            .play_fast(&AudioInput::binary(speech_wav(0.5)), LipSyncOptions::new())
            .await;
        assert!(second.success, "{:?}", second.error);
        assert!(!second.data.unwrap().interrupted);

        let replaced = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("replaced clip never settled")
            .unwrap();
        assert!(replaced.data.unwrap().interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_audio_reports_interaction_required() {
        let manager = ContextManager::clocked(48_000);
        let gate = InteractionGate::new(manager.clone());
        let orchestrator = PlaybackOrchestrator::new(
            manager.clone(),
            gate,
            Arc::new(VolumeControl::default()),
            DeviceProfile::host(),
        );
        let player = LipSyncPlayer::new(
            orchestrator,
            LipSyncAnalyzer::new(manager, AnalysisConfig::default()),
            Duration::from_millis(16),
        );

        let result = player
            .play_fast(&AudioInput::binary(speech_wav(0.5)), LipSyncOptions::new())
            .await;
        assert!(result.requires_interaction());
    }
}
