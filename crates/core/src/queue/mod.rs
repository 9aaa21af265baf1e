//! System-wide utterance queue.
//!
//! Utterances play strictly one after another in submission order. The
//! queue also owns the engine's [`VolumeControl`].

mod volume;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

pub use volume::VolumeControl;

use crate::{
    coordinator::{LipSyncOptions, LipSyncPlayer, PlaybackSummary},
    orchestrator::OperationResult,
    AudioError, AudioInput,
};

pub type UtteranceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    UtteranceStarted(UtteranceId),
    UtteranceFinished(UtteranceId),
    /// Nothing is playing and nothing is waiting.
    AllIdle,
}

/// Handle to one submitted utterance.
#[derive(Debug)]
pub struct UtteranceTicket {
    id: UtteranceId,
    outcome: oneshot::Receiver<OperationResult<PlaybackSummary>>,
}

impl UtteranceTicket {
    pub fn id(&self) -> UtteranceId {
        self.id
    }

    /// Resolves once the utterance has played, failed, or been cancelled.
    pub async fn wait(self) -> OperationResult<PlaybackSummary> {
        self.outcome.await.unwrap_or_else(|_| {
            OperationResult::failed(AudioError::playback_failed("audio queue shut down"))
        })
    }
}

struct Utterance {
    id: UtteranceId,
    input: AudioInput,
    options: LipSyncOptions,
    outcome: oneshot::Sender<OperationResult<PlaybackSummary>>,
}

/// Cheap to clone; all clones feed the same queue. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct AudioQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    coordinator: LipSyncPlayer,
    volume: Arc<VolumeControl>,
    pending: Mutex<VecDeque<Utterance>>,
    outstanding: AtomicUsize,
    /// Bumped by `stop_all` so in-flight work does not touch the reset
    /// counters.
    epoch: AtomicU64,
    next_id: AtomicU64,
    events: broadcast::Sender<QueueEvent>,
    idle: watch::Sender<bool>,
    wake: mpsc::UnboundedSender<()>,
}

impl AudioQueue {
    pub fn new(coordinator: LipSyncPlayer, volume: Arc<VolumeControl>) -> Self {
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (idle, _) = watch::channel(true);

        let inner = Arc::new(QueueInner {
            coordinator,
            volume,
            pending: Mutex::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            events,
            idle,
            wake,
        });
        tokio::spawn(worker(Arc::downgrade(&inner), wake_rx));
        Self { inner }
    }

    pub fn volume(&self) -> &Arc<VolumeControl> {
        &self.inner.volume
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner.volume.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.volume.set_muted(muted);
    }

    pub fn coordinator(&self) -> &LipSyncPlayer {
        &self.inner.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Utterances currently playing.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Utterances waiting their turn.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    pub fn submit(&self, input: AudioInput, options: LipSyncOptions) -> UtteranceTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (outcome, outcome_rx) = oneshot::channel();

        let depth = {
            let mut pending = self.inner.pending.lock();
            pending.push_back(Utterance {
                id,
                input,
                options,
                outcome,
            });
            pending.len()
        };
        self.inner.idle.send_replace(false);
        let _ = self.inner.wake.send(());
        debug!(id, depth, "utterance queued");

        UtteranceTicket {
            id,
            outcome: outcome_rx,
        }
    }

    /// Resolves when nothing is playing or waiting.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Drops every waiting utterance, stops the current one and resets the
    /// counters. Dropped tickets resolve with a `playback-failed` result.
    pub fn stop_all(&self) {
        let dropped: Vec<Utterance> = self.inner.pending.lock().drain(..).collect();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.outstanding.store(0, Ordering::SeqCst);
        self.inner.coordinator.stop();

        info!(cancelled = dropped.len(), "stopping all audio");
        for utterance in dropped {
            let _ = utterance.outcome.send(OperationResult::failed(AudioError::playback_failed(
                format!("utterance {} cancelled before it played", utterance.id),
            )));
        }
        self.inner.mark_idle();
    }
}

impl QueueInner {
    fn next(&self) -> Option<Utterance> {
        self.pending.lock().pop_front()
    }

    fn mark_idle(&self) {
        self.idle.send_replace(true);
        let _ = self.events.send(QueueEvent::AllIdle);
    }

    async fn play(&self, utterance: Utterance) {
        let Utterance {
            id,
            input,
            options,
            outcome,
        } = utterance;

        let epoch = self.epoch.load(Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(QueueEvent::UtteranceStarted(id));

        let result = self.coordinator.play_with_lip_sync(&input, options).await;
        debug!(id, success = result.success, "utterance finished");

        let current = self.epoch.load(Ordering::SeqCst) == epoch;
        if current {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        let _ = self.events.send(QueueEvent::UtteranceFinished(id));
        let _ = outcome.send(result);

        if current && self.outstanding.load(Ordering::SeqCst) == 0 && self.pending.lock().is_empty()
        {
            self.mark_idle();
        }
    }
}

async fn worker(queue: Weak<QueueInner>, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        loop {
            let Some(inner) = queue.upgrade() else { return };
            let Some(utterance) = inner.next() else { break };
            inner.play(utterance).await;
        }
    }
}

impl std::fmt::Debug for AudioQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioQueue")
            .field("outstanding", &self.outstanding())
            .field("pending", &self.pending())
            .field("volume", &self.inner.volume)
            .finish()
    }
}
