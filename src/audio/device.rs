//! Seams between the audio engine and the hardware.
//!
//! The ALSA implementations live in `alsa_device`; anything else (test
//! doubles, other backends) only has to implement these traits.

use std::sync::Arc;

use super::frame::PlaybackBuffer;
use crate::error::LinkError;

/// Identifies one scheduled playback buffer.
pub type SourceId = u64;

/// Called by the output device, from its own thread, when a source finished.
pub type CompletionFn = Arc<dyn Fn(SourceId) + Send + Sync>;

/// A microphone that can be opened.
pub trait CaptureDevice: Send + Sync + 'static {
    /// Open the device asking for mono at `sample_rate`. Called on the capture
    /// thread, which then owns the returned stream until capture stops.
    fn open(&self, sample_rate: u32) -> Result<Box<dyn CaptureStream>, LinkError>;
}

/// An open microphone. Dropping it releases the device.
pub trait CaptureStream {
    /// Rate the hardware actually runs at.
    fn sample_rate(&self) -> u32;

    /// Append mono samples in [-1, 1] to `out`. Blocks for at most about one
    /// device period. Returns the number of samples appended.
    fn read(&mut self, out: &mut Vec<f32>) -> Result<usize, LinkError>;
}

/// A speaker that can be opened.
pub trait OutputDevice: Send + Sync + 'static {
    fn open(
        &self,
        sample_rate: u32,
        on_complete: CompletionFn,
    ) -> Result<Box<dyn OutputStream>, LinkError>;
}

/// An open speaker with its own clock. Dropping it releases the device.
pub trait OutputStream: Send {
    /// Device clock in seconds; monotonic.
    fn now(&self) -> f64;

    /// Play `buffer` starting at device time `start_at`. `on_complete(id)`
    /// fires once playback has finished.
    fn play_at(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), LinkError>;

    /// Silence everything scheduled so far, right now. Stopped sources do not
    /// fire their completion.
    fn stop_all(&mut self);
}
