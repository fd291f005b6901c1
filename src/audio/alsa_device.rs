//! ALSA PCM devices for capture and playback.
//!
//! - Capture: S16LE interleaved → downmix → mono f32
//! - Playback: f32 buffer → resample/upmix to negotiated params → S16LE, on a
//!   dedicated thread that owns the PCM and fires completion callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use alsa::pcm::{Access, Format, HwParams, IO, PCM};
use alsa::{Direction, ValueOr};
use tokio::sync::mpsc;

use super::codec;
use super::device::{
    CaptureDevice, CaptureStream, CompletionFn, OutputDevice, OutputStream, SourceId,
};
use super::frame::PlaybackBuffer;
use super::AudioConfig;
use crate::error::LinkError;

const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// Consecutive failed writes tolerated before a buffer is abandoned.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

fn classify(err: &alsa::Error, device: &str, dir_name: &str) -> LinkError {
    let msg = format!("{} device '{}': {}", dir_name, device, err);
    match err.errno().abs() {
        EPERM | EACCES => LinkError::PermissionDenied(msg),
        _ => LinkError::DeviceUnavailable(msg),
    }
}

/// Open a PCM device for capture (recording).
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, AlsaParams), LinkError> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), LinkError> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams), LinkError> {
    let pcm = PCM::new(device, direction, false).map_err(|e| classify(&e, device, dir_name))?;

    // Configure hardware parameters
    let params = configure(&pcm, sample_rate, channels, period_size)
        .map_err(|e| classify(&e, device, dir_name))?;

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

fn configure(
    pcm: &PCM,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> alsa::Result<AlsaParams> {
    {
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let hwp = pcm.hw_params_current()?;
    Ok(AlsaParams {
        sample_rate: hwp.get_rate()?,
        channels: hwp.get_channels()?,
        period_size: hwp.get_period_size()? as usize,
    })
}

// ======================== Capture ========================

/// The operator's microphone.
#[derive(Debug, Clone)]
pub struct AlsaCaptureDevice {
    device: String,
    channels: u32,
}

impl AlsaCaptureDevice {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device: config.capture_device.clone(),
            channels: config.capture_channels.max(1),
        }
    }
}

impl CaptureDevice for AlsaCaptureDevice {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn CaptureStream>, LinkError> {
        let (pcm, params) = open_capture(&self.device, sample_rate, self.channels)?;
        let read_buf = vec![0i16; params.period_size.max(1) * params.channels as usize];
        Ok(Box::new(AlsaCaptureStream {
            pcm,
            params,
            read_buf,
        }))
    }
}

struct AlsaCaptureStream {
    pcm: PCM,
    params: AlsaParams,
    // ALSA read buffer (interleaved i16, one period)
    read_buf: Vec<i16>,
}

impl CaptureStream for AlsaCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<usize, LinkError> {
        let io = self
            .pcm
            .io_i16()
            .map_err(|e| LinkError::DeviceUnavailable(format!("capture io: {}", e)))?;
        match io.readi(&mut self.read_buf) {
            Ok(frames) => {
                let channels = self.params.channels as usize;
                downmix_to_mono(&self.read_buf[..frames * channels], channels, out);
                Ok(frames)
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm.prepare().map_err(|e2| {
                    LinkError::DeviceUnavailable(format!("failed to recover PCM capture: {}", e2))
                })?;
                Ok(0)
            }
        }
    }
}

/// Average interleaved channels into mono f32.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize, out: &mut Vec<f32>) {
    let channels = channels.max(1);
    out.reserve(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        out.push(codec::dequantize((sum / channels as i32) as i16));
    }
}

// ======================== Playback ========================

/// The console speaker.
#[derive(Debug, Clone)]
pub struct AlsaOutputDevice {
    device: String,
    channels: u32,
    period_size: Option<usize>,
}

impl AlsaOutputDevice {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device: config.playback_device.clone(),
            channels: config.playback_channels.max(1),
            period_size: (config.playback_period_size > 0).then_some(config.playback_period_size),
        }
    }
}

enum PlaybackCommand {
    Play {
        id: SourceId,
        generation: u64,
        start_at: f64,
        buffer: PlaybackBuffer,
    },
    Flush,
}

impl OutputDevice for AlsaOutputDevice {
    fn open(
        &self,
        sample_rate: u32,
        on_complete: CompletionFn,
    ) -> Result<Box<dyn OutputStream>, LinkError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), LinkError>>();
        let generation = Arc::new(AtomicU64::new(0));
        let epoch = Instant::now();

        let handle = {
            let device = self.device.clone();
            let channels = self.channels;
            let period_size = self.period_size;
            let generation = generation.clone();
            thread::Builder::new()
                .name("radio-playback".into())
                .spawn(move || {
                    let (pcm, params) =
                        match open_playback(&device, sample_rate, channels, period_size) {
                            Ok(opened) => opened,
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        };
                    let _ = ready_tx.send(Ok(()));
                    if let Err(e) =
                        playback_thread(&pcm, &params, epoch, &mut rx, &generation, &on_complete)
                    {
                        log::error!("Playback thread error: {}", e);
                    }
                    log::info!("Playback stopped");
                })
                .map_err(|e| {
                    LinkError::DeviceUnavailable(format!("failed to spawn playback thread: {e}"))
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(AlsaOutputStream {
                tx: Some(tx),
                epoch,
                generation,
                handle: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(LinkError::DeviceUnavailable(
                    "playback thread exited before opening the device".into(),
                ))
            }
        }
    }
}

struct AlsaOutputStream {
    tx: Option<mpsc::UnboundedSender<PlaybackCommand>>,
    epoch: Instant,
    generation: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl OutputStream for AlsaOutputStream {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play_at(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), LinkError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.tx
            .as_ref()
            .ok_or_else(|| LinkError::DeviceUnavailable("playback stream closed".into()))?
            .send(PlaybackCommand::Play {
                id,
                generation,
                start_at,
                buffer,
            })
            .map_err(|_| LinkError::DeviceUnavailable("playback thread stopped".into()))
    }

    fn stop_all(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(PlaybackCommand::Flush);
        }
    }
}

impl Drop for AlsaOutputStream {
    fn drop(&mut self) {
        self.stop_all();
        // Closing the channel ends the playback thread
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

enum WriteOutcome {
    Complete,
    Interrupted,
    Failed,
}

fn playback_thread(
    pcm: &PCM,
    params: &AlsaParams,
    epoch: Instant,
    rx: &mut mpsc::UnboundedReceiver<PlaybackCommand>,
    generation: &AtomicU64,
    on_complete: &CompletionFn,
) -> anyhow::Result<()> {
    let io = pcm.io_i16()?;
    let rate = params.sample_rate as f64;
    let channels = params.channels as usize;
    let chunk = params.period_size.max(64) * channels;

    // Device time at which everything written so far has played out
    let mut written_until = 0.0f64;

    while let Some(cmd) = rx.blocking_recv() {
        let (id, requested_generation, start_at, buffer) = match cmd {
            PlaybackCommand::Flush => {
                PCM::drop(pcm)?;
                pcm.prepare()?;
                written_until = epoch.elapsed().as_secs_f64();
                continue;
            }
            PlaybackCommand::Play {
                id,
                generation,
                start_at,
                buffer,
            } => (id, generation, start_at, buffer),
        };
        if requested_generation != generation.load(Ordering::SeqCst) {
            continue;
        }

        // The device drained while idle: the next write starts at now
        let now = epoch.elapsed().as_secs_f64();
        if written_until < now {
            written_until = now;
        }

        let mut pcm_data: Vec<i16> = Vec::new();
        let lead = start_at - written_until;
        if lead > 0.0 {
            let silent_frames = (lead * rate).round() as usize;
            pcm_data.resize(silent_frames * channels, 0);
        }
        pcm_data.extend(convert_for_device(&buffer, params.sample_rate, params.channels));
        let total_frames = pcm_data.len() / channels;

        let interrupted = || generation.load(Ordering::SeqCst) != requested_generation;
        match write_frames(pcm, &io, &pcm_data, channels, chunk, interrupted) {
            WriteOutcome::Complete => {
                written_until += total_frames as f64 / rate;
                on_complete(id);
            }
            // A flush follows; the source was already cleared by the scheduler
            WriteOutcome::Interrupted => {}
            WriteOutcome::Failed => {
                written_until = epoch.elapsed().as_secs_f64();
                on_complete(id);
            }
        }
    }

    Ok(())
}

/// Write decoded PCM to ALSA with a retry loop to handle short writes and
/// XRUN recovery without losing frames.
fn write_frames(
    pcm: &PCM,
    io: &IO<'_, i16>,
    data: &[i16],
    channels: usize,
    chunk: usize,
    interrupted: impl Fn() -> bool,
) -> WriteOutcome {
    let total_frames = data.len() / channels;
    let mut frames_written = 0;
    let mut retry_count = 0u32;

    while frames_written < total_frames {
        if interrupted() {
            return WriteOutcome::Interrupted;
        }
        let offset = frames_written * channels;
        let end = (offset + chunk).min(data.len());
        match io.writei(&data[offset..end]) {
            Ok(n) => {
                frames_written += n;
                retry_count = 0;
            }
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering...", e);
                retry_count += 1;

                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    return WriteOutcome::Failed;
                }

                // The device cannot keep up: drop the rest instead of spinning
                if retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!(
                        "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                        retry_count,
                        total_frames - frames_written
                    );
                    return WriteOutcome::Failed;
                }
            }
        }
    }
    WriteOutcome::Complete
}

/// Resample (linear) and upmix a mono buffer to the device's parameters.
pub fn convert_for_device(buffer: &PlaybackBuffer, rate: u32, channels: u32) -> Vec<i16> {
    let mono = resample_linear(buffer.samples(), buffer.sample_rate(), rate);
    let channels = channels.max(1) as usize;
    let mut out = Vec::with_capacity(mono.len() * channels);
    for s in mono {
        let q = codec::quantize(s);
        out.extend(std::iter::repeat_n(q, channels));
    }
    out
}

/// Linear-interpolation resampler, good enough for speech.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_to_mono(&[32767, 32767, 0, -32767, 100, 300], 2, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 1.0);
        assert!((out[1] - (-0.5)).abs() < 1e-4);
        assert!((out[2] - 200.0 / 32767.0).abs() < 1e-6);
    }

    #[test]
    fn resample_keeps_duration() {
        let input = vec![0.5f32; 24_000];
        let out = resample_linear(&input, 24_000, 48_000);
        assert_eq!(out.len(), 48_000);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        let down = resample_linear(&input, 24_000, 16_000);
        assert_eq!(down.len(), 16_000);
    }

    #[test]
    fn resample_interpolates_between_samples() {
        let out = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn device_conversion_upmixes_to_stereo() {
        let buffer = PlaybackBuffer::new(vec![0.5, -0.5], 24_000);
        let out = convert_for_device(&buffer, 24_000, 2);
        assert_eq!(out, vec![16384, 16384, -16384, -16384]);
    }
}
