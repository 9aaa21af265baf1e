use std::sync::Arc;

use tracing::info;

use crate::{
    config::EngineConfig,
    context::{AudioHost, ClockedHost},
    coordinator::LipSyncPlayer,
    gate::{InteractionGate, ListenerHost, NoopListenerHost},
    lipsync::LipSyncAnalyzer,
    orchestrator::{DeviceProfile, PlaybackOrchestrator},
    queue::{AudioQueue, VolumeControl},
    ContextManager, Result,
};

/// Every component of the speech engine, wired around one rendering context.
#[derive(Debug, Clone)]
pub struct VoiceEngine {
    config: EngineConfig,
    manager: ContextManager,
    gate: InteractionGate,
    orchestrator: PlaybackOrchestrator,
    analyzer: LipSyncAnalyzer,
    coordinator: LipSyncPlayer,
    queue: AudioQueue,
}

impl VoiceEngine {
    /// Builds the engine. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig, host: Arc<dyn AudioHost>) -> Self {
        Self::with_listener_host(config, host, Arc::new(NoopListenerHost))
    }

    pub fn with_listener_host(
        config: EngineConfig,
        host: Arc<dyn AudioHost>,
        listeners: Arc<dyn ListenerHost>,
    ) -> Self {
        let manager = ContextManager::new(host);
        let gate = InteractionGate::with_listener_host(manager.clone(), listeners);
        let volume = Arc::new(VolumeControl::from_config(&config.playback));
        let profile = DeviceProfile::detect(&config.device);

        let orchestrator =
            PlaybackOrchestrator::new(manager.clone(), gate.clone(), volume.clone(), profile);
        let analyzer = LipSyncAnalyzer::new(manager.clone(), config.analysis.clone());
        let coordinator = LipSyncPlayer::new(
            orchestrator.clone(),
            analyzer.clone(),
            config.playback.tick_interval(),
        );
        let queue = AudioQueue::new(coordinator.clone(), volume);

        info!(host = manager.host_name(), "voice engine assembled");
        Self {
            config,
            manager,
            gate,
            orchestrator,
            analyzer,
            coordinator,
            queue,
        }
    }

    /// Engine over the runtime-clocked host.
    pub fn clocked(config: EngineConfig) -> Self {
        let host = Arc::new(ClockedHost::new(config.audio.sample_rate));
        Self::new(config, host)
    }

    /// Engine that renders to the configured output device.
    #[cfg(feature = "hardware-audio")]
    pub fn with_output_device(config: EngineConfig) -> Self {
        let host = Arc::new(crate::context::DeviceHost::new(
            config.audio.output_device.clone(),
        ));
        Self::new(config, host)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &ContextManager {
        &self.manager
    }

    pub fn gate(&self) -> &InteractionGate {
        &self.gate
    }

    pub fn orchestrator(&self) -> &PlaybackOrchestrator {
        &self.orchestrator
    }

    pub fn analyzer(&self) -> &LipSyncAnalyzer {
        &self.analyzer
    }

    pub fn coordinator(&self) -> &LipSyncPlayer {
        &self.coordinator
    }

    pub fn queue(&self) -> &AudioQueue {
        &self.queue
    }

    /// Stops all audio and closes the rendering context.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.stop_all();
        self.manager.dispose().await?;
        info!("voice engine shut down");
        Ok(())
    }
}
