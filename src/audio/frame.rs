//! Audio units exchanged between the capture, transport and playback paths.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Mono PCM16 samples as produced by the capture path, tagged with the
/// sample rate they were captured at. Consumed once by the send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Little-endian PCM16 bytes, the binary wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    /// base64 of [`to_bytes`](Self::to_bytes), the text-safe wire form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// MIME type announcing the sample rate, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Decoded samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    duration: f64,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        Self {
            samples,
            sample_rate,
            duration,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds on the output clock.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_are_little_endian() {
        let frame = AudioFrame::new(vec![1, -2, 0x1234], 16_000);
        assert_eq!(frame.to_bytes(), vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn durations_follow_their_own_clock() {
        let frame = AudioFrame::new(vec![0; 4096], 16_000);
        assert!((frame.duration() - 0.256).abs() < 1e-9);

        let buffer = PlaybackBuffer::new(vec![0.0; 12_000], 24_000);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }
}
