//! Decode facade: validation, last-good caching, format dispatch.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use uvcstream_proto::{PixelFormat, StreamFormat};

use crate::mjpeg::{MjpegDecoder, MjpegOutcome};
use crate::validate::{validate_mjpeg, validate_yuy2, ValidationReporter, ValidationStats};
use crate::yuv::yuy2_to_bgra;
use crate::{DecodeError, DecodeResult, FrameValidation};

/// Fill byte for unusable frames: a dark blue that reads as "no signal"
/// rather than garbage.
const PRE_FILL_BYTE: u8 = 0x40;

/// How long after a resolution change mismatched MJPEG dimensions are
/// treated as stream settling rather than corruption.
const RESOLUTION_TRANSITION_GRACE: Duration = Duration::from_millis(500);

const MAX_INITIAL_LOGS: u64 = 5;

/// MJPEG decode counters for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct MjpegStats {
    pub attempts: u64,
    pub decoded: u64,
    pub no_soi: u64,
    pub header_errors: u64,
    pub decode_errors: u64,
    pub dimension_mismatches: u64,
    pub transition_skips: u64,
}

struct LastGoodFrame {
    bgra: Vec<u8>,
    width: u32,
    height: u32,
}

/// Converts raw frames into BGRA output buffers.
///
/// Owned by the delivery thread; not shared. A validation failure never
/// fails the call: with frame repeat enabled the last good image is served
/// again, otherwise the buffer is pre-filled dark and a best-effort decode
/// still runs (partial frames often render partially).
pub struct Decoder {
    mjpeg: MjpegDecoder,
    validation: ValidationStats,
    reporter: ValidationReporter,
    mjpeg_stats: MjpegStats,
    last_good: Option<LastGoodFrame>,
    frame_repeat: bool,
    resolution_changed_at: Option<Instant>,
    mismatch_warnings: u64,
}

impl Decoder {
    pub fn new(frame_repeat: bool) -> DecodeResult<Self> {
        Ok(Self {
            mjpeg: MjpegDecoder::new()?,
            validation: ValidationStats::default(),
            reporter: ValidationReporter::default(),
            mjpeg_stats: MjpegStats::default(),
            last_good: None,
            frame_repeat,
            resolution_changed_at: None,
            mismatch_warnings: 0,
        })
    }

    /// Marks the start of a resolution change; mismatched MJPEG dimensions
    /// are skipped silently until the first matching frame or the grace
    /// period runs out.
    pub fn note_resolution_change(&mut self) {
        self.resolution_changed_at = Some(Instant::now());
        self.last_good = None;
    }

    pub fn validation_stats(&self) -> ValidationStats {
        self.validation
    }

    pub fn mjpeg_stats(&self) -> MjpegStats {
        self.mjpeg_stats
    }

    pub fn reset_stats(&mut self) {
        self.validation.reset();
        self.mjpeg_stats = MjpegStats::default();
    }

    /// Decodes one raw frame into `out` (BGRA, stride = width * 4). Returns
    /// the validation verdict so the caller can feed its statistics.
    pub fn decode(
        &mut self,
        raw: &[u8],
        format: &StreamFormat,
        out: &mut [u8],
    ) -> DecodeResult<FrameValidation> {
        let needed = format.decoded_frame_size();
        if out.len() < needed {
            return Err(DecodeError::OutputTooSmall {
                needed,
                actual: out.len(),
            });
        }
        let out = &mut out[..needed];

        let validation = match format.pixel_format {
            PixelFormat::Mjpeg => validate_mjpeg(raw),
            PixelFormat::Yuy2 => validate_yuy2(raw, format.width, format.height),
        };
        self.validation.record(validation);
        self.reporter.maybe_report(&self.validation);

        if !validation.is_valid() {
            if self.frame_repeat {
                if let Some(last) = &self.last_good {
                    if last.width == format.width && last.height == format.height {
                        out.copy_from_slice(&last.bgra);
                        self.validation.repeated += 1;
                        return Ok(validation);
                    }
                }
            }
            // No substitute available: make partial output presentable.
            out.fill(PRE_FILL_BYTE);
        }

        let wrote = match format.pixel_format {
            PixelFormat::Yuy2 => {
                yuy2_to_bgra(raw, format.width as usize, format.height as usize, out);
                true
            }
            PixelFormat::Mjpeg => self.decode_mjpeg(raw, format, out),
        };

        if validation.is_valid() && wrote {
            self.cache_last_good(format, out);
        }

        Ok(validation)
    }

    fn decode_mjpeg(&mut self, raw: &[u8], format: &StreamFormat, out: &mut [u8]) -> bool {
        self.mjpeg_stats.attempts += 1;

        let outcome =
            self.mjpeg
                .decode(raw, format.width, format.height, self.in_transition(), out);
        match outcome {
            MjpegOutcome::Decoded { width, height } => {
                self.mjpeg_stats.decoded += 1;
                if width != format.width || height != format.height {
                    self.record_mismatch(format, width, height);
                }
                if let Some(changed_at) = self.resolution_changed_at.take() {
                    info!(
                        settle_ms = changed_at.elapsed().as_millis() as u64,
                        width,
                        height,
                        "first frame after resolution change"
                    );
                }
                true
            }
            MjpegOutcome::NoSoi => {
                self.mjpeg_stats.no_soi += 1;
                false
            }
            MjpegOutcome::HeaderFailed => {
                self.mjpeg_stats.header_errors += 1;
                false
            }
            MjpegOutcome::DimensionSkipped { width, height } => {
                self.record_mismatch(format, width, height);
                false
            }
            MjpegOutcome::DecodeFailed => {
                self.mjpeg_stats.decode_errors += 1;
                false
            }
        }
    }

    fn in_transition(&self) -> bool {
        self.resolution_changed_at
            .is_some_and(|t| t.elapsed() < RESOLUTION_TRANSITION_GRACE)
    }

    fn record_mismatch(&mut self, format: &StreamFormat, width: u32, height: u32) {
        if self.in_transition() {
            self.mjpeg_stats.transition_skips += 1;
            return;
        }
        self.mjpeg_stats.dimension_mismatches += 1;
        self.mismatch_warnings += 1;
        if self.mismatch_warnings <= MAX_INITIAL_LOGS {
            warn!(
                jpeg_width = width,
                jpeg_height = height,
                expected_width = format.width,
                expected_height = format.height,
                "embedded JPEG dimensions differ from negotiated format"
            );
        }
    }

    fn cache_last_good(&mut self, format: &StreamFormat, out: &[u8]) {
        match &mut self.last_good {
            Some(last) if last.width == format.width && last.height == format.height => {
                last.bgra.copy_from_slice(out);
            }
            _ => {
                self.last_good = Some(LastGoodFrame {
                    bgra: out.to_vec(),
                    width: format.width,
                    height: format.height,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuy2_format(width: u32, height: u32) -> StreamFormat {
        StreamFormat {
            pixel_format: PixelFormat::Yuy2,
            width,
            height,
            frame_interval: 333_333,
            format_index: 1,
            frame_index: 1,
        }
    }

    fn white_yuy2(width: u32, height: u32) -> Vec<u8> {
        let mut raw = Vec::with_capacity((width * height * 2) as usize);
        for _ in 0..(width * height / 2) {
            raw.extend_from_slice(&[235, 128, 235, 128]);
        }
        raw
    }

    #[test]
    fn valid_yuy2_decodes_and_is_cached() {
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(true).unwrap();
        let mut out = vec![0u8; format.decoded_frame_size()];

        let verdict = decoder
            .decode(&white_yuy2(4, 2), &format, &mut out)
            .unwrap();
        assert_eq!(verdict, FrameValidation::Valid);
        assert!(out[0] >= 250);
        assert!(decoder.last_good.is_some());
    }

    #[test]
    fn invalid_frame_repeats_last_good() {
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(true).unwrap();
        let mut out = vec![0u8; format.decoded_frame_size()];
        decoder
            .decode(&white_yuy2(4, 2), &format, &mut out)
            .unwrap();

        let mut out2 = vec![0u8; format.decoded_frame_size()];
        let verdict = decoder.decode(&[0u8; 2], &format, &mut out2).unwrap();
        assert_eq!(verdict, FrameValidation::Incomplete);
        // Served from the cache, not pre-filled.
        assert_eq!(out2, out);
        assert_eq!(decoder.validation_stats().repeated, 1);
    }

    #[test]
    fn invalid_frame_without_repeat_pre_fills() {
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(false).unwrap();
        let mut out = vec![0u8; format.decoded_frame_size()];

        let verdict = decoder.decode(&[], &format, &mut out).unwrap();
        assert_eq!(verdict, FrameValidation::Incomplete);
        assert!(out.iter().all(|&b| b == PRE_FILL_BYTE));
    }

    #[test]
    fn valid_frame_is_not_pre_filled() {
        // A valid decode overwrites everything, so the sentinel value the
        // buffer starts with must survive nowhere.
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(false).unwrap();
        let mut out = vec![0xEEu8; format.decoded_frame_size()];
        decoder
            .decode(&white_yuy2(4, 2), &format, &mut out)
            .unwrap();
        assert!(out.iter().all(|&b| b != 0xEE));
    }

    #[test]
    fn output_buffer_contract_is_checked() {
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(false).unwrap();
        let mut out = vec![0u8; 4];
        let err = decoder
            .decode(&white_yuy2(4, 2), &format, &mut out)
            .unwrap_err();
        assert!(matches!(err, DecodeError::OutputTooSmall { .. }));
    }

    #[test]
    fn resolution_change_invalidates_cache() {
        let format = yuy2_format(4, 2);
        let mut decoder = Decoder::new(true).unwrap();
        let mut out = vec![0u8; format.decoded_frame_size()];
        decoder
            .decode(&white_yuy2(4, 2), &format, &mut out)
            .unwrap();
        decoder.note_resolution_change();

        let mut out2 = vec![0u8; format.decoded_frame_size()];
        decoder.decode(&[0u8; 2], &format, &mut out2).unwrap();
        assert!(out2.iter().all(|&b| b == PRE_FILL_BYTE));
    }
}
