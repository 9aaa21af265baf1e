//! Viseme analysis of speech audio.
//!
//! Batch analysis walks the decoded waveform in fixed windows and labels
//! each one with a mouth shape. Results are cached by content fingerprint,
//! so the same bytes are only analysed once.

mod cache;
mod realtime;
mod window;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use cache::{AnalysisCache, CacheStats, ContentFingerprint};
pub use realtime::{LiveInput, RealTimeSession};
pub use window::{classify, SpectralProbe, WindowFeatures};

use crate::{
    config::AnalysisConfig,
    format::{self, NormalizedAudio},
    AudioError, AudioErrorKind, AudioInput, ContextManager, Result,
};
use window::FeatureExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouthShape {
    /// Silence.
    #[default]
    Rest,
    /// Lips together: m, b, p.
    Closed,
    Narrow,
    Open,
    /// o, u, w.
    Round,
    /// s, f, sh.
    Fricative,
}

impl MouthShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Closed => "closed",
            Self::Narrow => "narrow",
            Self::Open => "open",
            Self::Round => "round",
            Self::Fricative => "fricative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisemeFrame {
    /// Seconds from the start of the clip.
    pub time: f32,
    /// Mouth opening in `[0, 1]`.
    pub open: f32,
    pub shape: MouthShape,
    /// Window RMS.
    pub loudness: f32,
}

impl VisemeFrame {
    pub fn rest(time: f32) -> Self {
        Self {
            time,
            open: 0.0,
            shape: MouthShape::Rest,
            loudness: 0.0,
        }
    }
}

/// Frames ordered by time plus the clip duration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LipSyncResult {
    frames: Vec<VisemeFrame>,
    duration: f32,
}

impl LipSyncResult {
    pub fn new(mut frames: Vec<VisemeFrame>, duration: f32) -> Self {
        frames.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { frames, duration }
    }

    pub fn frames(&self) -> &[VisemeFrame] {
        &self.frames
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Latest frame at or before `time`, or a rest frame before the first.
    pub fn frame_at(&self, time: f32) -> VisemeFrame {
        match self.frames.partition_point(|frame| frame.time <= time) {
            0 => VisemeFrame::rest(time),
            index => self.frames[index - 1],
        }
    }
}

/// Cheap to clone; clones share the cache and counters.
#[derive(Clone)]
pub struct LipSyncAnalyzer {
    inner: Arc<AnalyzerInner>,
}

struct AnalyzerInner {
    manager: ContextManager,
    config: AnalysisConfig,
    cache: Arc<AnalysisCache>,
    runs: AtomicU64,
}

impl LipSyncAnalyzer {
    pub fn new(manager: ContextManager, config: AnalysisConfig) -> Self {
        let cache = Arc::new(AnalysisCache::new(config.cache_capacity));
        Self::with_cache(manager, config, cache)
    }

    /// Analyzer backed by an externally owned cache.
    pub fn with_cache(
        manager: ContextManager,
        config: AnalysisConfig,
        cache: Arc<AnalysisCache>,
    ) -> Self {
        Self {
            inner: Arc::new(AnalyzerInner {
                manager,
                config,
                cache,
                runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.inner.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Number of full decode-and-window passes performed. Cache hits do not
    /// count.
    pub fn analysis_runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Batch analysis with the configured deadline.
    pub async fn analyze(&self, input: &AudioInput) -> Result<Arc<LipSyncResult>> {
        self.analyze_with_timeout(input, self.inner.config.timeout())
            .await
    }

    pub async fn analyze_with_timeout(
        &self,
        input: &AudioInput,
        timeout: Duration,
    ) -> Result<Arc<LipSyncResult>> {
        let audio = format::normalize(input)?;
        if audio.is_empty() {
            return Err(AudioError::invalid_data("cannot analyse an empty buffer"));
        }

        let fingerprint = ContentFingerprint::of(&audio.bytes);
        if let Some(cached) = self.inner.cache.get(&fingerprint) {
            debug!(%fingerprint, "lip-sync cache hit");
            return Ok(cached);
        }

        let byte_len = audio.len();
        let result = tokio::time::timeout(timeout, self.run(audio))
            .await
            .map_err(|_| {
                AudioError::new(
                    AudioErrorKind::Timeout,
                    format!("lip-sync analysis of {byte_len} bytes exceeded {timeout:?}"),
                )
            })??;

        let result = Arc::new(result);
        self.inner.cache.insert(fingerprint, result.clone());
        Ok(result)
    }

    /// Streams frames from a live signal until the session is stopped.
    ///
    /// Never initializes the rendering context itself; it fails when the
    /// context has not been initialized yet.
    pub fn analyze_real_time<F>(&self, input: LiveInput, on_frame: F) -> Result<RealTimeSession>
    where
        F: FnMut(VisemeFrame) + Send + 'static,
    {
        if !self.inner.manager.is_initialized() {
            return Err(AudioError::initialization_failed(
                "real-time lip-sync needs an initialized audio context",
            ));
        }
        Ok(RealTimeSession::spawn(input, &self.inner.config, on_frame))
    }

    async fn run(&self, audio: NormalizedAudio) -> Result<LipSyncResult> {
        self.inner.runs.fetch_add(1, Ordering::SeqCst);
        let config = &self.inner.config;

        let decoded = self.inner.manager.decode(audio).await?;
        let duration = decoded.duration().as_secs_f32();
        let sample_rate = decoded.sample_rate.max(1);
        let samples = decoded.mono();

        let window_ms = if duration >= config.long_clip_seconds {
            config.long_window_ms
        } else {
            config.short_window_ms
        };
        let window = (sample_rate as usize * window_ms as usize / 1000).max(2);
        let yield_every = config.yield_every.max(1);

        let mut extractor = FeatureExtractor::new(config.spectral_probe);
        let mut frames = Vec::with_capacity(samples.len() / window + 1);
        for (index, chunk) in samples.chunks(window).enumerate() {
            if index > 0 && index % yield_every == 0 {
                tokio::task::yield_now().await;
            }

            let features = extractor.measure(chunk)?;
            let (shape, open) = classify(features, config.spectral_probe, config.silence_threshold);
            frames.push(VisemeFrame {
                time: (index * window) as f32 / sample_rate as f32,
                open,
                shape,
                loudness: features.rms,
            });
        }

        info!(duration, window_ms, frames = frames.len(), "lip-sync analysis complete");
        Ok(LipSyncResult::new(frames, duration))
    }
}

impl std::fmt::Debug for LipSyncAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LipSyncAnalyzer")
            .field("probe", &self.inner.config.spectral_probe)
            .field("runs", &self.analysis_runs())
            .field("cache", &self.inner.cache)
            .finish()
    }
}
