//! Microphone capture on a dedicated OS thread.
//!
//! Capture thread: device read → resample to 16 kHz → accumulate → fixed-size
//! frame → PCM16 encode → registered sink. Uses std::thread (NOT tokio tasks)
//! so capture timing never depends on the async runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::AudioConfig;
use super::INPUT_SAMPLE_RATE_HZ;
use super::codec;
use super::device::{CaptureDevice, CaptureStream};
use super::frame::AudioFrame;
use crate::error::LinkError;

type SinkSlot = Mutex<Option<mpsc::Sender<AudioFrame>>>;

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
}

/// Owns the microphone while open.
pub struct Capturer {
    running: Arc<AtomicBool>,
    sink: Arc<SinkSlot>,
    counters: Arc<Counters>,
    device_rate: u32,
    failures: Option<mpsc::Receiver<LinkError>>,
    handle: Option<JoinHandle<()>>,
}

impl Capturer {
    /// Open the microphone and start capturing.
    ///
    /// The device is opened on the capture thread; this call waits for the
    /// outcome so `PermissionDenied` / `DeviceUnavailable` reach the caller.
    pub fn open(device: Arc<dyn CaptureDevice>, config: &AudioConfig) -> Result<Self, LinkError> {
        let running = Arc::new(AtomicBool::new(true));
        let sink: Arc<SinkSlot> = Arc::new(Mutex::new(None));
        let counters = Arc::new(Counters::default());
        let frame_duration_ms = config.frame_duration_ms.max(1);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, LinkError>>();
        // A read error ends capture; the owner hears about it here
        let (fail_tx, fail_rx) = mpsc::channel::<LinkError>(1);

        let handle = {
            let running = running.clone();
            let sink = sink.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name("radio-capture".into())
                .spawn(move || {
                    let mut stream = match device.open(INPUT_SAMPLE_RATE_HZ) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(stream.sample_rate()));
                    if let Err(e) = capture_loop(
                        stream.as_mut(),
                        frame_duration_ms,
                        &sink,
                        &counters,
                        &running,
                    ) {
                        log::error!("Capture read failed, stopping capture: {}", e);
                        let _ = fail_tx.try_send(e);
                    }
                })
                .map_err(|e| {
                    LinkError::DeviceUnavailable(format!("failed to spawn capture thread: {e}"))
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(device_rate)) => {
                log::info!(
                    "Capture started: device={}, device rate={}Hz, frame={}ms at {}Hz",
                    config.capture_device,
                    device_rate,
                    frame_duration_ms,
                    INPUT_SAMPLE_RATE_HZ
                );
                Ok(Self {
                    running,
                    sink,
                    counters,
                    device_rate,
                    failures: Some(fail_rx),
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(LinkError::DeviceUnavailable(
                    "capture thread exited before opening the device".into(),
                ))
            }
        }
    }

    /// Register (or clear) the destination for encoded frames.
    pub fn set_sink(&self, sink: Option<mpsc::Sender<AudioFrame>>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Rate of the frames handed to the sink. Always the input leg rate.
    pub fn sample_rate(&self) -> u32 {
        INPUT_SAMPLE_RATE_HZ
    }

    /// Rate the hardware actually runs at.
    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Receiver for the error that ended capture, if it ever fails.
    /// Can be taken once.
    pub fn take_failures(&mut self) -> Option<mpsc::Receiver<LinkError>> {
        self.failures.take()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop capturing and release the device. Closing twice is a no-op.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.set_sink(None);
        if handle.join().is_err() {
            log::error!("Capture thread panicked");
        }
        let stats = self.stats();
        log::info!(
            "Capture stopped: forwarded={}, dropped={}",
            stats.frames_forwarded,
            stats.frames_dropped
        );
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Linear-interpolation resampler that keeps its position across reads, so
/// read and frame boundaries leave no seams.
struct StreamResampler {
    // input samples per output sample
    step: f64,
    // position of the next output sample within `pending`
    pos: f64,
    pending: Vec<f32>,
}

impl StreamResampler {
    fn new(from: u32, to: u32) -> Self {
        Self {
            step: from as f64 / to as f64,
            pos: 0.0,
            pending: Vec::new(),
        }
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.pending.extend_from_slice(input);
        while self.pos + 1.0 < self.pending.len() as f64 {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            let a = self.pending[idx];
            let b = self.pending[idx + 1];
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        let consumed = (self.pos.floor() as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.pos -= consumed as f64;
    }
}

fn capture_loop(
    stream: &mut dyn CaptureStream,
    frame_duration_ms: u32,
    sink: &SinkSlot,
    counters: &Counters,
    running: &AtomicBool,
) -> Result<(), LinkError> {
    let device_rate = stream.sample_rate();
    let frame_samples =
        ((INPUT_SAMPLE_RATE_HZ as u64 * frame_duration_ms as u64) / 1000).max(1) as usize;
    let mut resampler = (device_rate != INPUT_SAMPLE_RATE_HZ && device_rate > 0)
        .then(|| StreamResampler::new(device_rate, INPUT_SAMPLE_RATE_HZ));

    // Device-rate samples, only used when resampling
    let mut raw: Vec<f32> = Vec::new();
    // Accumulation buffer at 16 kHz, drained one frame at a time
    let mut accum: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    while running.load(Ordering::Relaxed) {
        match resampler.as_mut() {
            Some(resampler) => {
                stream.read(&mut raw)?;
                resampler.process(&raw, &mut accum);
                raw.clear();
            }
            None => {
                stream.read(&mut accum)?;
            }
        }

        while accum.len() >= frame_samples {
            let frame = codec::encode(&accum[..frame_samples], INPUT_SAMPLE_RATE_HZ);
            accum.drain(..frame_samples);
            forward(frame, sink, counters);
        }
    }
    Ok(())
}

/// Hand a frame to the sink without ever waiting on it.
fn forward(frame: AudioFrame, sink: &SinkSlot, counters: &Counters) {
    let guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(tx) = guard.as_ref() else {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };
    match tx.try_send(frame) {
        Ok(()) => {
            counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Full(_)) => {
            let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("Frame sink full, dropping frame (dropped={})", dropped);
        }
        Err(TrySendError::Closed(_)) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Frame sink closed, dropping frame");
        }
    }
}
