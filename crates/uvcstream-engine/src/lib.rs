//! Streaming session engine.
//!
//! Everything above the wire: format negotiation, the transfer pump,
//! resolution fallback, the control surface, and session orchestration. The
//! adapter layer (media node, CLI, test harness) talks to [`CameraSession`].

pub mod config;
mod controls;
mod fallback;
mod negotiate;
mod pump;
mod session;
mod stats;

pub use controls::{ControlError, ControlId, ControlRange, ControlResult, ControlSurface};
pub use fallback::{FallbackConfig, FallbackController, FallbackDecision};
pub use negotiate::{
    AudioTransport, HighBandwidthState, Negotiated, NegotiatedTransport, NegotiationError,
    Negotiator,
};
pub use pump::{PumpShared, VideoEndpoint, VideoPump};
pub use session::{CameraSession, DecodedFrame, FrameInfo, SessionConfig};
pub use stats::{
    AudioSnapshot, FrameSnapshot, SessionEvent, SessionMetrics, TransportSnapshot, TransportStats,
};

use thiserror::Error;

/// Errors surfaced by the session API.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Protocol(#[from] uvcstream_proto::ProtocolError),

    #[error(transparent)]
    Transport(#[from] uvcstream_usb::TransportError),

    #[error(transparent)]
    Decode(#[from] uvcstream_decode::DecodeError),

    #[error(transparent)]
    Audio(#[from] uvcstream_audio::AudioError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// The device's ladder has no entry with these dimensions.
    #[error("unsupported resolution {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    /// No frame arrived within the delivery timeout. The stream keeps
    /// running; the caller simply retries.
    #[error("timed out waiting for a frame")]
    FrameTimeout,

    #[error("stream is not running")]
    NotStreaming,

    #[error("stream already running")]
    AlreadyStreaming,

    /// The stream was stopped while a caller was waiting.
    #[error("stream stopped")]
    Stopped,

    #[error("device disconnected")]
    Disconnected,

    #[error("device has no audio interface")]
    NoAudio,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for session operations.
pub type StreamResult<T> = Result<T, StreamError>;
