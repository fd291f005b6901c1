//! audio - Capture, playback scheduling and the PCM16 wire codec
//!
//! Uses ALSA for audio I/O on dedicated OS threads; everything above the
//! device traits in `device` is hardware independent.

pub mod alsa_device;
mod capture;
pub mod codec;
mod device;
mod frame;
mod playback;

pub use alsa_device::{AlsaCaptureDevice, AlsaOutputDevice};
pub use capture::{CaptureStats, Capturer};
pub use device::{CaptureDevice, CaptureStream, CompletionFn, OutputDevice, OutputStream, SourceId};
pub use frame::{AudioFrame, PlaybackBuffer};
pub use playback::{PlaybackScheduler, ScheduledSource};

/// Microphone leg, sent to the remote speech session.
pub const INPUT_SAMPLE_RATE_HZ: u32 = 16_000;
/// Agent speech leg. Independent clock from the input leg.
pub const OUTPUT_SAMPLE_RATE_HZ: u32 = 24_000;

/// Audio configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Channels requested from the capture device; downmixed to mono
    pub capture_channels: u32,
    /// Channels requested from the playback device; mono is duplicated
    pub playback_channels: u32,
    /// Duration of one captured frame in ms
    pub frame_duration_ms: u32,
    /// Cursor lag behind the device clock that is reported as starvation
    pub starvation_threshold_ms: u32,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
    /// Frames buffered between the capture thread and the session
    pub frame_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            capture_channels: 1,
            playback_channels: 1,
            frame_duration_ms: 256,
            starvation_threshold_ms: 200,
            playback_period_size: 1024,
            frame_queue: 32,
        }
    }
}
