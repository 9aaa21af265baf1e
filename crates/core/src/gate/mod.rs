//! User-gesture gate in front of the rendering context.
//!
//! Hosts refuse to start audio hardware until the user has interacted with
//! the page. The gate listens broadly for the first trusted gesture, unlocks
//! the context once, runs everything that queued up while waiting, and then
//! removes its listeners.

use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{AudioError, ContextManager, Result};

/// Gesture classes that count as user activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GestureKind {
    PointerDown,
    PointerUp,
    MouseDown,
    Click,
    TouchStart,
    TouchEnd,
    KeyDown,
}

impl GestureKind {
    pub const ALL: [GestureKind; 7] = [
        GestureKind::PointerDown,
        GestureKind::PointerUp,
        GestureKind::MouseDown,
        GestureKind::Click,
        GestureKind::TouchStart,
        GestureKind::TouchEnd,
        GestureKind::KeyDown,
    ];

    /// DOM event name the host binds for this gesture.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::PointerDown => "pointerdown",
            Self::PointerUp => "pointerup",
            Self::MouseDown => "mousedown",
            Self::Click => "click",
            Self::TouchStart => "touchstart",
            Self::TouchEnd => "touchend",
            Self::KeyDown => "keydown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureEvent {
    pub kind: GestureKind,
    /// Synthetic events do not grant activation.
    pub trusted: bool,
}

impl GestureEvent {
    pub fn trusted(kind: GestureKind) -> Self {
        Self {
            kind,
            trusted: true,
        }
    }

    pub fn synthetic(kind: GestureKind) -> Self {
        Self {
            kind,
            trusted: false,
        }
    }
}

/// How the gate asks the host to bind its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    pub kinds: Vec<GestureKind>,
    /// Observe during the capture phase, ahead of application handlers.
    pub capture: bool,
    pub passive: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            kinds: GestureKind::ALL.to_vec(),
            capture: true,
            passive: true,
        }
    }
}

/// Document-level listener registry provided by the embedding shell.
pub trait ListenerHost: Send + Sync {
    fn install(&self, options: &ListenerOptions);

    fn remove(&self, options: &ListenerOptions);
}

/// For hosts that call [`InteractionGate::handle_gesture`] directly.
#[derive(Debug, Default)]
pub struct NoopListenerHost;

impl ListenerHost for NoopListenerHost {
    fn install(&self, _options: &ListenerOptions) {}

    fn remove(&self, _options: &ListenerOptions) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// A caller needs the UI to ask the user for a gesture.
    PromptNeeded,
    InteractionObserved(GestureKind),
    ListenersRemoved,
}

/// Work deferred until the first gesture.
pub type PendingCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct InteractionGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    manager: ContextManager,
    listeners: Arc<dyn ListenerHost>,
    options: ListenerOptions,
    state: Mutex<GateState>,
    ready: watch::Sender<bool>,
    events: broadcast::Sender<GateEvent>,
}

#[derive(Default)]
struct GateState {
    interacted: bool,
    listening: bool,
    draining: bool,
    pending: VecDeque<PendingCallback>,
}

impl InteractionGate {
    pub fn new(manager: ContextManager) -> Self {
        Self::with_listener_host(manager, Arc::new(NoopListenerHost))
    }

    pub fn with_listener_host(manager: ContextManager, listeners: Arc<dyn ListenerHost>) -> Self {
        let options = ListenerOptions::default();
        listeners.install(&options);
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(GateInner {
                manager,
                listeners,
                options,
                state: Mutex::new(GateState {
                    listening: true,
                    ..GateState::default()
                }),
                ready,
                events,
            }),
        }
    }

    pub fn has_interacted(&self) -> bool {
        self.inner.state.lock().interacted
    }

    /// True once a gesture has been seen or the context is already running.
    pub fn is_ready(&self) -> bool {
        self.has_interacted() || self.inner.manager.is_running()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.inner.events.subscribe()
    }

    /// Feeds a gesture observed by the host. Only the first trusted gesture
    /// does anything; it returns `Ok(true)`.
    pub async fn handle_gesture(&self, event: GestureEvent) -> Result<bool> {
        if !event.trusted {
            debug!(kind = ?event.kind, "ignoring synthetic gesture");
            return Ok(false);
        }

        {
            let mut state = self.inner.state.lock();
            if !state.listening || state.interacted {
                return Ok(false);
            }
            state.interacted = true;
            state.listening = false;
            state.draining = true;
        }

        info!(kind = event.kind.event_name(), "user interaction observed");
        let _ = self
            .inner
            .events
            .send(GateEvent::InteractionObserved(event.kind));

        let unlocked = self.inner.manager.initialize().await;
        if let Err(err) = &unlocked {
            warn!(%err, "audio context failed to start after interaction");
        }

        self.drain_pending();
        self.inner.listeners.remove(&self.inner.options);
        let _ = self.inner.events.send(GateEvent::ListenersRemoved);
        self.inner.ready.send_replace(true);

        unlocked.map(|_| true)
    }

    /// Makes sure the context is running, failing with
    /// `interaction-required` when no gesture has unlocked it yet.
    pub async fn ensure_context(&self) -> Result<()> {
        if self.has_interacted() {
            return self.inner.manager.ensure_resumed().await;
        }
        if self.inner.manager.is_running() {
            return Ok(());
        }
        Err(AudioError::interaction_required(
            "audio is blocked until the user interacts with the kiosk",
        ))
    }

    /// Signals that a prompt should be shown. Returns whether one is needed.
    pub fn request_interaction(&self) -> bool {
        if self.is_ready() {
            return false;
        }
        let _ = self.inner.events.send(GateEvent::PromptNeeded);
        true
    }

    /// Runs `callback` now if the gate is open, otherwise queues it. Returns
    /// `true` when it ran immediately.
    pub fn execute_when_ready(&self, callback: PendingCallback) -> bool {
        {
            let mut state = self.inner.state.lock();
            let open = (state.interacted || self.inner.manager.is_running()) && !state.draining;
            if !open {
                state.pending.push_back(callback);
                debug!(pending = state.pending.len(), "callback queued until interaction");
                return false;
            }
        }

        run_callback(callback);
        true
    }

    pub async fn wait_until_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Returns the gate to its initial state and reinstalls the listeners.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            let was_listening = state.listening;
            *state = GateState {
                listening: true,
                ..GateState::default()
            };
            if !was_listening {
                self.inner.listeners.install(&self.inner.options);
            }
        }
        self.inner.ready.send_replace(false);
    }

    fn drain_pending(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                match state.pending.pop_front() {
                    Some(callback) => callback,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            run_callback(next);
        }
    }
}

fn run_callback(callback: PendingCallback) {
    if let Err(err) = callback() {
        warn!(%err, "deferred audio callback failed");
    }
}

impl fmt::Debug for InteractionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InteractionGate")
            .field("interacted", &state.interacted)
            .field("listening", &state.listening)
            .field("pending", &state.pending.len())
            .finish()
    }
}
