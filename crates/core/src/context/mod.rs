//! Ownership of the single audio graph handle.
//!
//! Hosts hand out a very limited number of context handles, so the whole
//! engine shares one through [`ContextManager`]. Consumers never cache the
//! handle across suspension points; they go back through the manager, which
//! resumes or recreates it on the same code path.

mod backend;
mod clocked;
mod decode;
#[cfg(feature = "hardware-audio")]
mod device;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use backend::{
    AudioHost, DecodedAudio, GainNode, HandleState, HostContext, TransportNode, TransportRequest,
};
pub use clocked::ClockedHost;
#[cfg(feature = "hardware-audio")]
pub use device::DeviceHost;

use crate::{format::NormalizedAudio, Result};

/// Lifecycle of the managed handle as seen by the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initializing,
    Running,
    Suspended,
    Closed,
}

/// Injectable owner of the rendering context. Cheap to clone.
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    host: Arc<dyn AudioHost>,
    // Held across handle creation so concurrent initialisers share one handle.
    slot: tokio::sync::Mutex<Option<Arc<dyn HostContext>>>,
    state: Mutex<ContextState>,
    creations: AtomicU64,
}

impl ContextManager {
    pub fn new(host: Arc<dyn AudioHost>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                host,
                slot: tokio::sync::Mutex::new(None),
                state: Mutex::new(ContextState::Uninitialized),
                creations: AtomicU64::new(0),
            }),
        }
    }

    /// Manager over a [`ClockedHost`].
    pub fn clocked(sample_rate: u32) -> Self {
        Self::new(Arc::new(ClockedHost::new(sample_rate)))
    }

    pub fn host_name(&self) -> &'static str {
        self.inner.host.name()
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    /// True once a handle exists, whether running or suspended.
    pub fn is_initialized(&self) -> bool {
        matches!(self.state(), ContextState::Running | ContextState::Suspended)
    }

    /// Number of handles ever created through this manager.
    pub fn handle_creations(&self) -> u64 {
        self.inner.creations.load(Ordering::SeqCst)
    }

    /// Creates the handle if needed and makes sure it is running.
    pub async fn initialize(&self) -> Result<Arc<dyn HostContext>> {
        self.obtain(true).await
    }

    /// Idempotent resume, safe to call before every playback attempt.
    pub async fn ensure_resumed(&self) -> Result<()> {
        self.obtain(true).await.map(|_| ())
    }

    /// The live handle, without creating or resuming anything.
    pub async fn current(&self) -> Option<Arc<dyn HostContext>> {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .filter(|context| context.state() != HandleState::Closed)
            .cloned()
    }

    /// Decodes through the managed handle. Decoding does not need a running
    /// context, so this creates the handle if necessary but never resumes it.
    pub async fn decode(&self, audio: NormalizedAudio) -> Result<crate::context::DecodedAudio> {
        let context = self.obtain(false).await?;
        context.decode(audio).await
    }

    pub async fn suspend(&self) -> Result<()> {
        let slot = self.inner.slot.lock().await;
        if let Some(context) = slot.as_ref() {
            if context.state() == HandleState::Running {
                context.suspend().await?;
                self.set_state(ContextState::Suspended);
            }
        }
        Ok(())
    }

    /// Closes the handle. A later [`initialize`](Self::initialize) creates a
    /// fresh one.
    pub async fn dispose(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(context) = slot.take() {
            context.close().await?;
            info!(host = self.host_name(), "audio context closed");
        }
        self.set_state(ContextState::Closed);
        Ok(())
    }

    async fn obtain(&self, resume: bool) -> Result<Arc<dyn HostContext>> {
        let mut slot = self.inner.slot.lock().await;

        let context = match slot.as_ref() {
            Some(context) if context.state() != HandleState::Closed => context.clone(),
            _ => {
                let previous = self.state();
                self.set_state(ContextState::Initializing);
                let context = match self.inner.host.create_context().await {
                    Ok(context) => context,
                    Err(err) => {
                        warn!(%err, host = self.host_name(), "failed to create audio context");
                        self.set_state(previous);
                        return Err(err);
                    }
                };
                self.inner.creations.fetch_add(1, Ordering::SeqCst);
                self.set_state(ContextState::Suspended);
                *slot = Some(context.clone());
                context
            }
        };

        if resume && context.state() != HandleState::Running {
            context.resume().await?;
            debug!(host = self.host_name(), "audio context resumed");
        }

        self.set_state(match context.state() {
            HandleState::Running => ContextState::Running,
            HandleState::Suspended => ContextState::Suspended,
            HandleState::Closed => ContextState::Closed,
        });
        Ok(context)
    }

    fn set_state(&self, next: ContextState) {
        *self.inner.state.lock() = next;
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("host", &self.host_name())
            .field("state", &self.state())
            .field("handle_creations", &self.handle_creations())
            .finish()
    }
}
