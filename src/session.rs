//! One voice session at a time: transport + capturer + playback scheduler.
//!
//! `Idle → Connecting → Active → Closing → Idle`, with `Errored` reachable
//! from `Connecting` or `Active`. The pump task is the only writer of session
//! state besides `stop()`; both go through the same mutex, which is never held
//! across an `.await` nor while audio threads are joined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioFrame, Capturer, OUTPUT_SAMPLE_RATE_HZ, PlaybackScheduler};
use crate::config::{Config, WireFormat};
use crate::error::LinkError;
use crate::net_link::{NetEvent, SessionHandle, SpeechEndpoint};
use crate::protocol::{self, Payload};

const EVENT_QUEUE: usize = 64;
const BROADCAST_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closing,
    Errored,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Active => "active",
            LinkState::Closing => "closing",
            LinkState::Errored => "errored",
        }
    }
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connecting,
    Active,
    Errored(String),
    /// The remote side ended the session.
    RemoteClosed,
    /// The session was stopped locally.
    Stopped,
}

/// Counters for the current (or last) session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_scheduled: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Everything one session owns.
struct AudioSession {
    id: Uuid,
    capturer: Capturer,
    scheduler: Option<PlaybackScheduler>,
    transport: Option<SessionHandle>,
}

impl AudioSession {
    /// Close the transport, stop capture and silence playback. Safe to call
    /// more than once.
    fn release(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.capturer.close();
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.reset();
        }
    }
}

struct Shared {
    session: Mutex<Option<AudioSession>>,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<AudioSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set_state(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Voice link: {:?} -> {:?}", previous, next);
        }
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Take session `id` out of the slot. Releasing happens after the lock is
    /// gone since it joins the audio threads.
    fn take_session(&self, id: Uuid) -> Option<AudioSession> {
        let mut guard = self.lock();
        if guard.as_ref().is_some_and(|s| s.id == id) {
            guard.take()
        } else {
            None
        }
    }

    /// Release everything and park the link in `Errored` until `stop()`.
    fn fail(&self, id: Uuid, reason: String) {
        let Some(mut session) = self.take_session(id) else {
            return;
        };
        log::error!("Voice session {} failed: {}", id, reason);
        session.release();
        drop(session);
        self.set_state(LinkState::Errored);
        self.emit(LinkEvent::Errored(reason));
    }

    /// Returns false once the pump has nothing left to do.
    fn on_event(
        &self,
        id: Uuid,
        event: NetEvent,
        sink: &mut Option<mpsc::Sender<AudioFrame>>,
    ) -> bool {
        match event {
            NetEvent::Open => {
                let guard = self.lock();
                let Some(session) = guard.as_ref().filter(|s| s.id == id) else {
                    return false;
                };
                if self.state() != LinkState::Connecting {
                    return true;
                }
                session.capturer.set_sink(sink.take());
                self.set_state(LinkState::Active);
                drop(guard);
                self.emit(LinkEvent::Active);
                true
            }
            NetEvent::Message(payload) => self.on_payload(id, &payload),
            NetEvent::Error(reason) => {
                self.fail(id, reason);
                false
            }
            NetEvent::Closed => {
                let Some(mut session) = self.take_session(id) else {
                    return false;
                };
                log::info!("Voice session {} closed by remote", id);
                self.set_state(LinkState::Closing);
                session.release();
                drop(session);
                self.set_state(LinkState::Idle);
                self.emit(LinkEvent::RemoteClosed);
                false
            }
        }
    }

    fn on_payload(&self, id: Uuid, payload: &Payload) -> bool {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut().filter(|s| s.id == id) else {
            return false;
        };
        if self.state() != LinkState::Active {
            log::debug!("Ignoring message received while {:?}", self.state());
            return true;
        }
        let Some(scheduler) = session.scheduler.as_mut() else {
            return true;
        };

        for chunk in protocol::extract_audio(payload, OUTPUT_SAMPLE_RATE_HZ) {
            let buffer = match chunk {
                Ok(buffer) => buffer,
                Err(e) => {
                    log::warn!("Dropping malformed audio chunk: {}", e);
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if buffer.is_empty() {
                continue;
            }
            match scheduler.schedule(buffer) {
                Ok(_) => {
                    self.counters.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("Dropping audio chunk, playback refused it: {}", e);
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }

    fn on_frame(&self, id: Uuid, frame: AudioFrame, format: WireFormat) -> bool {
        let guard = self.lock();
        let Some(session) = guard.as_ref().filter(|s| s.id == id) else {
            return false;
        };
        if self.state() != LinkState::Active {
            return true;
        }
        let Some(transport) = session.transport.as_ref() else {
            return true;
        };
        match protocol::encode_frame(&frame, format) {
            Ok(msg) => {
                if transport.send(msg) {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                log::warn!("Failed to encode audio frame: {}", e);
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }
}

async fn pump(
    shared: Arc<Shared>,
    id: Uuid,
    format: WireFormat,
    mut events: mpsc::Receiver<NetEvent>,
    mut frames: mpsc::Receiver<AudioFrame>,
    frame_tx: mpsc::Sender<AudioFrame>,
    mut capture_failures: mpsc::Receiver<LinkError>,
) {
    // Handed to the capturer on Open
    let mut sink = Some(frame_tx);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    shared.fail(id, "transport ended without closing".to_string());
                    return;
                };
                if !shared.on_event(id, event, &mut sink) {
                    return;
                }
            }
            Some(frame) = frames.recv() => {
                if !shared.on_frame(id, frame, format) {
                    return;
                }
            }
            Some(err) = capture_failures.recv() => {
                shared.fail(id, format!("microphone failed: {err}"));
                return;
            }
        }
    }
}

/// Drives at most one [`AudioSession`] against a speech endpoint.
pub struct SessionManager {
    config: Config,
    endpoint: Arc<dyn SpeechEndpoint>,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(config: Config, endpoint: Arc<dyn SpeechEndpoint>) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (events, _) = broadcast::channel(BROADCAST_QUEUE);
        Self {
            config,
            endpoint,
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                state,
                events,
                counters: Counters::default(),
            }),
            pump: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Id of the installed session, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.lock().as_ref().map(|s| s.id)
    }

    /// Start a session with already opened audio resources.
    ///
    /// Only valid from `Idle`. Returns once the connection is initiated; the
    /// move to `Active` happens when the transport reports `Open`.
    pub async fn start(
        &mut self,
        mut capturer: Capturer,
        scheduler: PlaybackScheduler,
    ) -> Result<(), LinkError> {
        let state = self.state();
        if state != LinkState::Idle {
            return Err(LinkError::InvalidState(state));
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Already taken by someone else: nothing will ever arrive on it
        let capture_failures = capturer
            .take_failures()
            .unwrap_or_else(|| mpsc::channel(1).1);

        let id = Uuid::new_v4();
        *self.shared.lock() = Some(AudioSession {
            id,
            capturer,
            scheduler: Some(scheduler),
            transport: None,
        });
        self.shared.counters.reset();
        self.shared.set_state(LinkState::Connecting);
        self.shared.emit(LinkEvent::Connecting);
        log::info!("Starting voice session {}", id);

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let handle = match self.endpoint.connect(&self.config, event_tx).await {
            Ok(handle) => handle,
            Err(e) => {
                let e = if matches!(e, LinkError::Connection(_)) {
                    e
                } else {
                    LinkError::Connection(e.to_string())
                };
                self.shared.fail(id, e.to_string());
                return Err(e);
            }
        };

        {
            let mut guard = self.shared.lock();
            match guard.as_mut().filter(|s| s.id == id) {
                Some(session) => session.transport = Some(handle),
                None => handle.close(),
            }
        }

        let (frame_tx, frame_rx) = mpsc::channel(self.config.audio.frame_queue.max(1));
        self.pump = Some(tokio::spawn(pump(
            self.shared.clone(),
            id,
            self.config.wire_format,
            event_rx,
            frame_rx,
            frame_tx,
            capture_failures,
        )));
        Ok(())
    }

    /// Tear down the current session. A no-op when idle.
    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let session = self.shared.lock().take();
        let Some(mut session) = session else {
            // A failed session is already released; only the state is left
            if self.state() == LinkState::Errored {
                self.shared.set_state(LinkState::Closing);
                self.shared.set_state(LinkState::Idle);
                self.shared.emit(LinkEvent::Stopped);
            }
            return;
        };
        self.shared.set_state(LinkState::Closing);
        session.release();
        log::info!("Voice session {} stopped", session.id);
        drop(session);
        self.shared.set_state(LinkState::Idle);
        self.shared.emit(LinkEvent::Stopped);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
