//! MJPEG decoding through libjpeg-turbo.

use tracing::{debug, warn};

use crate::{DecodeError, DecodeResult};

/// UVC payloads may carry a short vendor prefix before the JPEG; the SOI
/// scan is bounded to this many bytes.
const SOI_SCAN_LIMIT: usize = 2048;

/// What happened to one MJPEG decode attempt. Data problems are outcomes,
/// not errors; the session counts them and keeps streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MjpegOutcome {
    /// Pixels were written at the given dimensions.
    Decoded { width: u32, height: u32 },
    NoSoi,
    HeaderFailed,
    /// Embedded dimensions differ from the negotiated format and the frame
    /// was not decoded: larger than the buffer, or mismatches are being
    /// skipped while the camera settles after a resolution change.
    DimensionSkipped { width: u32, height: u32 },
    DecodeFailed,
}

/// Wrapper around a reusable turbojpeg decompressor.
pub struct MjpegDecoder {
    decompressor: turbojpeg::Decompressor,
}

impl MjpegDecoder {
    pub fn new() -> DecodeResult<Self> {
        let decompressor = turbojpeg::Decompressor::new()
            .map_err(|e| DecodeError::DecoderInit(e.to_string()))?;
        Ok(Self { decompressor })
    }

    /// Finds the SOI marker within the first `SOI_SCAN_LIMIT` bytes.
    pub fn find_soi(data: &[u8]) -> Option<usize> {
        let limit = data.len().min(SOI_SCAN_LIMIT);
        data[..limit]
            .windows(2)
            .position(|w| w == [0xFF, 0xD8])
    }

    /// Decodes one frame into `out` as BGRA.
    ///
    /// When the embedded JPEG's dimensions differ from the negotiated ones
    /// the image decodes at its own size with a matching pitch (top-left of
    /// the buffer); it is never stretched. With `skip_mismatched` set, any
    /// dimension mismatch skips the frame without touching `out`.
    pub fn decode(
        &mut self,
        data: &[u8],
        expected_width: u32,
        expected_height: u32,
        skip_mismatched: bool,
        out: &mut [u8],
    ) -> MjpegOutcome {
        let Some(soi) = Self::find_soi(data) else {
            return MjpegOutcome::NoSoi;
        };
        let jpeg = &data[soi..];

        let header = match self.decompressor.read_header(jpeg) {
            Ok(header) => header,
            Err(err) => {
                debug!("MJPEG header read failed: {err}");
                return MjpegOutcome::HeaderFailed;
            }
        };
        let width = header.width as u32;
        let height = header.height as u32;

        let mismatched = width != expected_width || height != expected_height;
        if mismatched && (skip_mismatched || width > expected_width || height > expected_height) {
            return MjpegOutcome::DimensionSkipped { width, height };
        }

        let pitch = header.width * 4;
        let needed = pitch * header.height;
        let image = turbojpeg::Image {
            pixels: &mut out[..needed],
            width: header.width,
            pitch,
            height: header.height,
            format: turbojpeg::PixelFormat::BGRA,
        };

        match self.decompressor.decompress(jpeg, image) {
            Ok(()) => MjpegOutcome::Decoded { width, height },
            Err(err) => {
                warn!(width, height, "MJPEG decompress failed: {err}");
                MjpegOutcome::DecodeFailed
            }
        }
    }
}
