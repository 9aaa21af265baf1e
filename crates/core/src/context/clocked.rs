use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{
    decode::decode_off_thread, AudioHost, DecodedAudio, HandleState, HostContext, TransportNode,
    TransportRequest,
};
use crate::{format::NormalizedAudio, AudioError, Result};

/// Host whose transport nodes play out against the runtime clock instead of
/// an output device. Decoding is real; rendering is simulated.
#[derive(Debug)]
pub struct ClockedHost {
    sample_rate: u32,
    contexts_created: AtomicU64,
}

impl ClockedHost {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            contexts_created: AtomicU64::new(0),
        }
    }

    /// Number of context handles this host has ever produced.
    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::SeqCst)
    }
}

impl Default for ClockedHost {
    fn default() -> Self {
        Self::new(48_000)
    }
}

#[async_trait]
impl AudioHost for ClockedHost {
    fn name(&self) -> &'static str {
        "clocked"
    }

    async fn create_context(&self) -> Result<Arc<dyn HostContext>> {
        let serial = self.contexts_created.fetch_add(1, Ordering::SeqCst) + 1;
        info!(serial, sample_rate = self.sample_rate, "clocked audio context created");
        Ok(Arc::new(ClockedContext {
            sample_rate: self.sample_rate,
            state: Mutex::new(HandleState::Suspended),
        }))
    }
}

#[derive(Debug)]
struct ClockedContext {
    sample_rate: u32,
    state: Mutex<HandleState>,
}

impl ClockedContext {
    fn transition(&self, next: HandleState) -> Result<()> {
        let mut state = self.state.lock();
        if *state == HandleState::Closed {
            return Err(AudioError::initialization_failed("audio context has been closed"));
        }
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl HostContext for ClockedContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> HandleState {
        *self.state.lock()
    }

    async fn resume(&self) -> Result<()> {
        self.transition(HandleState::Running)
    }

    async fn suspend(&self) -> Result<()> {
        self.transition(HandleState::Suspended)
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = HandleState::Closed;
        Ok(())
    }

    async fn decode(&self, audio: NormalizedAudio) -> Result<DecodedAudio> {
        decode_off_thread(audio).await
    }

    fn start_transport(&self, request: TransportRequest) -> Result<Box<dyn TransportNode>> {
        if self.state() != HandleState::Running {
            return Err(AudioError::playback_failed(
                "audio context is not running; resume it before starting playback",
            ));
        }

        let TransportRequest {
            buffer,
            offset,
            ended,
            ..
        } = request;
        let remaining = buffer.duration().saturating_sub(offset);
        let finished = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let flag = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    flag.store(true, Ordering::SeqCst);
                    let _ = ended.send(());
                }
                _ = cancel_rx => {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        });

        debug!(?remaining, ?offset, "clocked transport started");
        Ok(Box::new(ClockedTransport {
            cancel: Some(cancel_tx),
            finished,
        }))
    }
}

#[derive(Debug)]
struct ClockedTransport {
    cancel: Option<oneshot::Sender<()>>,
    finished: Arc<AtomicBool>,
}

impl TransportNode for ClockedTransport {
    fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.cancel.is_none()
    }
}

impl Drop for ClockedTransport {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::GainNode;

    fn buffer(seconds: f32) -> Arc<DecodedAudio> {
        Arc::new(DecodedAudio {
            sample_rate: 100,
            channels: 1,
            samples: vec![0.0; (seconds * 100.0) as usize],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn transport_signals_end_after_buffer_duration() {
        let host = ClockedHost::default();
        let context = host.create_context().await.unwrap();
        context.resume().await.unwrap();

        let (ended, ended_rx) = oneshot::channel();
        let started = tokio::time::Instant::now();
        let node = context
            .start_transport(TransportRequest {
                buffer: buffer(2.0),
                offset: Duration::from_millis(500),
                gain: Arc::new(GainNode::default()),
                ended,
            })
            .unwrap();

        ended_rx.await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1510), "{elapsed:?}");
        assert!(node.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_transport_never_reports_end() {
        let host = ClockedHost::default();
        let context = host.create_context().await.unwrap();
        context.resume().await.unwrap();

        let (ended, ended_rx) = oneshot::channel();
        let mut node = context
            .start_transport(TransportRequest {
                buffer: buffer(1.0),
                offset: Duration::ZERO,
                gain: Arc::new(GainNode::default()),
                ended,
            })
            .unwrap();

        node.stop().unwrap();
        node.stop().unwrap();
        assert!(ended_rx.await.is_err());
    }

    #[tokio::test]
    async fn suspended_context_refuses_transport() {
        let host = ClockedHost::default();
        let context = host.create_context().await.unwrap();
        let (ended, _rx) = oneshot::channel();

        let err = context
            .start_transport(TransportRequest {
                buffer: buffer(1.0),
                offset: Duration::ZERO,
                gain: Arc::new(GainNode::default()),
                ended,
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::AudioErrorKind::PlaybackFailed);

        context.close().await.unwrap();
        assert!(context.resume().await.is_err());
    }
}
