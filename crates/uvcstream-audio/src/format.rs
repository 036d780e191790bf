//! PCM stream format.

use tracing::warn;

/// PCM sample format of the microphone stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

impl PcmFormat {
    /// Common webcam microphone defaults.
    pub const FALLBACK: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
        bits_per_sample: 16,
    };

    /// Replaces zeroed descriptor fields with the usual webcam values.
    pub fn with_fallbacks(mut self) -> Self {
        if self.sample_rate == 0 {
            warn!("audio descriptor missing sample rate, assuming 48 kHz");
            self.sample_rate = Self::FALLBACK.sample_rate;
        }
        if self.channels == 0 {
            warn!("audio descriptor missing channel count, assuming stereo");
            self.channels = Self::FALLBACK.channels;
        }
        if self.bits_per_sample == 0 {
            warn!("audio descriptor missing bit resolution, assuming 16-bit");
            self.bits_per_sample = Self::FALLBACK.bits_per_sample;
        }
        self
    }

    pub fn bytes_per_frame(&self) -> u32 {
        u32::from(self.channels) * u32::from(self.bits_per_sample / 8)
    }

    /// PCM bytes produced per millisecond, which is also the natural
    /// isochronous packet size at full speed.
    pub fn bytes_per_ms(&self) -> u32 {
        self.sample_rate * self.bytes_per_frame() / 1000
    }
}
