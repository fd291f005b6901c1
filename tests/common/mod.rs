#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_radio::audio::{
    CaptureDevice, CaptureStream, CompletionFn, OutputDevice, OutputStream, PlaybackBuffer,
    SourceId,
};
use fleet_radio::{Config, LinkError, NetCommand, NetEvent, SessionHandle, SpeechEndpoint};
use tokio::sync::mpsc;

pub const RAMP_WRAP: u64 = 30_000;

/// Test config: short frames, raw binary frames on the wire.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.wire_format = fleet_radio::WireFormat::Binary;
    config.audio.frame_duration_ms = 20;
    config.audio.frame_queue = 32;
    config
}

pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(3), wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

// ======================== Capture ========================

#[derive(Default)]
struct CaptureState {
    open_handles: AtomicUsize,
    opens: AtomicUsize,
    deny: AtomicBool,
    next_sample: AtomicU64,
    // reported whatever rate is requested
    rate: Mutex<Option<u32>>,
    // successful reads before the device dies
    fail_after: Mutex<Option<usize>>,
}

/// Microphone producing an integer ramp, 10 ms per read.
#[derive(Clone, Default)]
pub struct FakeCaptureDevice {
    state: Arc<CaptureState>,
}

impl FakeCaptureDevice {
    pub fn deny(&self, deny: bool) {
        self.state.deny.store(deny, Ordering::SeqCst);
    }

    pub fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    /// Run the hardware at `rate` instead of the requested rate.
    pub fn force_rate(&self, rate: u32) {
        *self.state.rate.lock().unwrap() = Some(rate);
    }

    /// Fail every read after the first `reads` of each stream.
    pub fn fail_after(&self, reads: usize) {
        *self.state.fail_after.lock().unwrap() = Some(reads);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCaptureDevice {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn CaptureStream>, LinkError> {
        if self.state.deny.load(Ordering::SeqCst) {
            return Err(LinkError::PermissionDenied("microphone access denied".into()));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.open_handles.fetch_add(1, Ordering::SeqCst);
        let sample_rate = self.state.rate.lock().unwrap().unwrap_or(sample_rate);
        let reads_left = *self.state.fail_after.lock().unwrap();
        Ok(Box::new(FakeCaptureStream {
            state: self.state.clone(),
            sample_rate,
            reads_left,
        }))
    }
}

struct FakeCaptureStream {
    state: Arc<CaptureState>,
    sample_rate: u32,
    reads_left: Option<usize>,
}

impl CaptureStream for FakeCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<usize, LinkError> {
        if let Some(left) = self.reads_left.as_mut() {
            if *left == 0 {
                return Err(LinkError::DeviceUnavailable("capture device unplugged".into()));
            }
            *left -= 1;
        }
        std::thread::sleep(Duration::from_millis(10));
        let n = (self.sample_rate / 100) as usize;
        for _ in 0..n {
            let v = self.state.next_sample.fetch_add(1, Ordering::SeqCst) % RAMP_WRAP;
            out.push(v as f32 / 32767.0);
        }
        Ok(n)
    }
}

impl Drop for FakeCaptureStream {
    fn drop(&mut self) {
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

// ======================== Output ========================

#[derive(Default)]
struct OutputState {
    now: f64,
    played: Vec<(SourceId, f64, f64)>,
    pending: Vec<SourceId>,
    on_complete: Option<CompletionFn>,
    open_handles: usize,
    stops: usize,
}

/// Speaker with a hand-driven clock. Nothing completes until the test says so.
#[derive(Clone, Default)]
pub struct FakeOutputDevice {
    state: Arc<Mutex<OutputState>>,
}

impl FakeOutputDevice {
    pub fn set_now(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    /// `(id, start_at, duration)` for every buffer handed to the device.
    pub fn played(&self) -> Vec<(SourceId, f64, f64)> {
        self.state.lock().unwrap().played.clone()
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().open_handles
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Finish every buffer still playing.
    pub fn complete_all(&self) {
        let (callback, pending) = {
            let mut state = self.state.lock().unwrap();
            (state.on_complete.clone(), std::mem::take(&mut state.pending))
        };
        if let Some(callback) = callback {
            for id in pending {
                callback(id);
            }
        }
    }
}

impl OutputDevice for FakeOutputDevice {
    fn open(
        &self,
        _sample_rate: u32,
        on_complete: CompletionFn,
    ) -> Result<Box<dyn OutputStream>, LinkError> {
        let mut state = self.state.lock().unwrap();
        state.on_complete = Some(on_complete);
        state.open_handles += 1;
        Ok(Box::new(FakeOutputStream {
            state: self.state.clone(),
        }))
    }
}

struct FakeOutputStream {
    state: Arc<Mutex<OutputState>>,
}

impl OutputStream for FakeOutputStream {
    fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn play_at(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.played.push((id, start_at, buffer.duration()));
        state.pending.push(id);
        Ok(())
    }

    fn stop_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.pending.clear();
    }
}

impl Drop for FakeOutputStream {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.open_handles -= 1;
        state.on_complete = None;
    }
}

// ======================== Endpoint ========================

#[derive(Default)]
struct EndpointState {
    events: Option<mpsc::Sender<NetEvent>>,
    commands: Option<mpsc::Receiver<NetCommand>>,
    connects: usize,
    refuse: bool,
}

/// Speech service the test drives by hand.
#[derive(Clone, Default)]
pub struct FakeEndpoint {
    state: Arc<Mutex<EndpointState>>,
}

impl FakeEndpoint {
    pub fn refuse(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Deliver a transport event to the latest connection.
    pub async fn emit(&self, event: NetEvent) {
        let tx = self
            .state
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("no connection yet");
        tx.send(event).await.expect("session stopped listening");
    }

    /// Everything the session sends on the latest connection.
    pub fn take_commands(&self) -> mpsc::Receiver<NetCommand> {
        self.state
            .lock()
            .unwrap()
            .commands
            .take()
            .expect("no connection yet")
    }
}

#[async_trait]
impl SpeechEndpoint for FakeEndpoint {
    async fn connect(
        &self,
        _config: &Config,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionHandle, LinkError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(LinkError::Connection("connection refused".into()));
        }
        let (tx_cmd, rx_cmd) = mpsc::channel(1024);
        state.connects += 1;
        state.events = Some(events);
        state.commands = Some(rx_cmd);
        Ok(SessionHandle::new(tx_cmd))
    }
}
