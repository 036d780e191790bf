//! Decode stage: validation, YUY2→BGRA, MJPEG→BGRA.
//!
//! Output is always BGRA8888, top-left origin, stride = width * 4, alpha
//! 0xFF. Validation failures never fail a decode call; they surface as
//! statistics and the output buffer stays presentable (last-good repeat or a
//! dark pre-fill).

mod decoder;
mod mjpeg;
mod validate;
mod yuv;

pub use decoder::{Decoder, MjpegStats};
pub use mjpeg::MjpegDecoder;
pub use validate::{validate_mjpeg, validate_yuy2, FrameValidation, ValidationStats};
pub use yuv::{tables, yuy2_to_bgra, YuvTables};

use thiserror::Error;

/// Errors surfaced by the decode stage. Per-frame data problems are not
/// errors; only setup and contract violations are.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The JPEG decompressor could not be created.
    #[error("JPEG decoder init failed: {0}")]
    DecoderInit(String),

    /// The caller's output buffer does not match the negotiated format.
    #[error("output buffer too small: need {needed}, got {actual}")]
    OutputTooSmall { needed: usize, actual: usize },
}

/// Result type for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
