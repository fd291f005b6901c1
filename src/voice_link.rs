//! The surface the operator UI talks to: two commands, two signals.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::audio::{
    AlsaCaptureDevice, AlsaOutputDevice, CaptureDevice, Capturer, OutputDevice,
    PlaybackScheduler,
};
use crate::config::Config;
use crate::error::LinkError;
use crate::net_link::{SpeechEndpoint, WsEndpoint};
use crate::session::{LinkEvent, LinkState, SessionManager, SessionStats};

pub struct VoiceLink {
    config: Config,
    capture_device: Arc<dyn CaptureDevice>,
    output_device: Arc<dyn OutputDevice>,
    manager: SessionManager,
    // Driven by the playback scheduler's active set
    speaking: Arc<watch::Sender<bool>>,
}

impl VoiceLink {
    pub fn new(
        config: Config,
        endpoint: Arc<dyn SpeechEndpoint>,
        capture_device: Arc<dyn CaptureDevice>,
        output_device: Arc<dyn OutputDevice>,
    ) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            manager: SessionManager::new(config.clone(), endpoint),
            config,
            capture_device,
            output_device,
            speaking: Arc::new(speaking),
        }
    }

    /// Websocket endpoint with the ALSA microphone and speaker from `config`.
    pub fn alsa(config: Config) -> Self {
        let capture = Arc::new(AlsaCaptureDevice::new(&config.audio));
        let output = Arc::new(AlsaOutputDevice::new(&config.audio));
        Self::new(config, Arc::new(WsEndpoint), capture, output)
    }

    /// Open the microphone and speaker, then connect.
    ///
    /// After a failed session this first tears the old one down, so a retry
    /// is always a plain call to this method.
    pub async fn start_voice_link(&mut self) -> Result<(), LinkError> {
        match self.manager.state() {
            LinkState::Idle => {}
            LinkState::Errored => {
                log::info!("Clearing failed session before restart");
                self.manager.stop();
            }
            other => return Err(LinkError::InvalidState(other)),
        }

        let capturer = Capturer::open(self.capture_device.clone(), &self.config.audio)?;
        // capturer is closed on drop if this fails
        let scheduler = PlaybackScheduler::open(
            self.output_device.as_ref(),
            &self.config.audio,
            self.speaking.clone(),
        )?;
        self.manager.start(capturer, scheduler).await
    }

    /// Never fails; a no-op when nothing is running.
    pub fn stop_voice_link(&mut self) {
        self.manager.stop();
    }

    pub fn is_link_active(&self) -> bool {
        self.manager.state() == LinkState::Active
    }

    pub fn is_agent_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn link_state(&self) -> LinkState {
        self.manager.state()
    }

    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.manager.watch_state()
    }

    pub fn watch_agent_speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.manager.subscribe()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.manager.session_stats()
    }
}
