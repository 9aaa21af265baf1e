use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::{
    window::{classify, FeatureExtractor},
    VisemeFrame,
};
use crate::config::AnalysisConfig;

/// A live mono signal delivered in blocks of any size.
#[derive(Debug)]
pub struct LiveInput {
    pub sample_rate: u32,
    pub blocks: mpsc::Receiver<Vec<f32>>,
}

impl LiveInput {
    /// Pairs a live input with the sender that feeds it.
    pub fn channel(sample_rate: u32, capacity: usize) -> (mpsc::Sender<Vec<f32>>, Self) {
        let (tx, blocks) = mpsc::channel(capacity.max(1));
        (tx, Self { sample_rate, blocks })
    }
}

/// Running streaming analysis. Dropping the session stops it.
#[derive(Debug)]
pub struct RealTimeSession {
    stop: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    frames: Arc<AtomicU64>,
}

impl RealTimeSession {
    pub(crate) fn spawn<F>(input: LiveInput, config: &AnalysisConfig, on_frame: F) -> Self
    where
        F: FnMut(VisemeFrame) + Send + 'static,
    {
        let (stop, stop_rx) = oneshot::channel();
        let frames = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run(input, config.clone(), on_frame, stop_rx, frames.clone()));
        Self {
            stop: Some(stop),
            worker: Some(worker),
            frames,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the worker and waits for it. Returns the number of frames
    /// delivered.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                warn!(%err, "real-time lip-sync worker panicked");
            }
        }
        self.frames_emitted()
    }
}

impl Drop for RealTimeSession {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn run<F>(
    mut input: LiveInput,
    config: AnalysisConfig,
    mut on_frame: F,
    mut stop: oneshot::Receiver<()>,
    emitted: Arc<AtomicU64>,
) where
    F: FnMut(VisemeFrame),
{
    let sample_rate = input.sample_rate.max(1);
    let window = (sample_rate as usize * config.short_window_ms as usize / 1000).max(2);
    let mut extractor = FeatureExtractor::new(config.spectral_probe);
    let mut pending: Vec<f32> = Vec::with_capacity(window * 2);
    let mut consumed: u64 = 0;

    debug!(sample_rate, window, "real-time lip-sync started");
    loop {
        tokio::select! {
            _ = &mut stop => break,
            block = input.blocks.recv() => {
                let Some(block) = block else { break };
                pending.extend_from_slice(&block);

                while pending.len() >= window {
                    let time = consumed as f32 / sample_rate as f32;
                    let features = match extractor.measure(&pending[..window]) {
                        Ok(features) => features,
                        Err(err) => {
                            warn!(%err, "dropping live window");
                            Default::default()
                        }
                    };
                    pending.drain(..window);
                    consumed += window as u64;

                    let (shape, open) =
                        classify(features, config.spectral_probe, config.silence_threshold);
                    on_frame(VisemeFrame {
                        time,
                        open,
                        shape,
                        loudness: features.rms,
                    });
                    emitted.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
    debug!(frames = emitted.load(Ordering::SeqCst), "real-time lip-sync stopped");
}
