//! UVC and USB-Audio Class wire protocol.
//!
//! Everything byte-level lives here: class-specific descriptor parsing, the
//! probe/commit control block, payload packet headers, and the control
//! selector tables. No transfers are performed by this crate.

pub mod consts;
mod descriptor;
mod format;
mod payload;
mod probe;

pub use descriptor::{
    parse_audio_control, parse_audio_streaming, parse_video_control, parse_video_streaming,
    AudioControlInfo, AudioFormatInfo, DeviceLayout, ProcessingUnitInfo, VideoControlInfo,
    VideoStreamingInfo,
};
pub use format::{FrameDescriptor, PixelFormat, StreamFormat};
pub use payload::{PayloadHeader, PayloadHeaderError};
pub use probe::{ProbeCommit, UvcVersion};

use thiserror::Error;

/// Errors raised while interpreting protocol bytes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A descriptor's length field points outside the buffer.
    #[error("descriptor truncated: claimed {claimed} bytes, {available} available")]
    TruncatedDescriptor { claimed: usize, available: usize },

    /// A descriptor is shorter than its fixed layout requires.
    #[error("descriptor too short for subtype {subtype:#04x}: {length} bytes")]
    ShortDescriptor { subtype: u8, length: usize },

    /// A control block did not have the expected size.
    #[error("control block size mismatch: expected {expected}, got {actual}")]
    ControlBlockSize { expected: usize, actual: usize },

    /// The streaming interface exposes no video format the core supports.
    #[error("no supported video format in descriptors")]
    NoSupportedFormat,
}

/// Result type for protocol parsing.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
