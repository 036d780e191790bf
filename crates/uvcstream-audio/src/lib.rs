//! USB-Audio microphone capture.
//!
//! A dedicated pump thread drives isochronous IN transfers and copies PCM
//! payload into a single-producer single-consumer byte ring; the consumer
//! pulls PCM out of the ring on its own thread. No locks on the data path.

mod format;
mod pump;
mod ring;

pub use format::PcmFormat;
pub use pump::{AudioPump, AudioPumpStats};
pub use ring::AudioRing;

use thiserror::Error;
use uvcstream_usb::TransportError;

/// Default ring capacity: power of two for cheap index masking.
pub const AUDIO_RING_CAPACITY: usize = 64 * 1024;

/// Isochronous packets per audio transfer.
pub const AUDIO_PACKETS_PER_TRANSFER: usize = 16;

/// Errors from the audio capture path.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio pump already started")]
    AlreadyStarted,

    #[error("audio pump not started")]
    NotStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
