//! Per-frame validation before decode.

use std::time::{Duration, Instant};

use tracing::{info, warn};

/// A frame shorter than this cannot be a real JPEG.
pub const MIN_MJPEG_FRAME_SIZE: usize = 1024;

/// A YUY2 frame below this fraction of the expected size is incomplete.
pub const MIN_YUY2_FRAME_PERCENT: usize = 90;

/// Consecutive invalid frames before a warning is logged.
pub const MAX_CONSECUTIVE_BAD_FRAMES: u32 = 10;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of validating a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameValidation {
    Valid,
    /// YUY2 shorter than the 90% floor.
    Incomplete,
    /// MJPEG without a leading SOI marker.
    NoSoi,
    /// MJPEG without an EOI marker in its last 32 bytes.
    NoEoi,
    /// MJPEG below the minimum plausible size.
    Truncated,
}

impl FrameValidation {
    pub fn is_valid(self) -> bool {
        self == FrameValidation::Valid
    }
}

/// Validates an assembled MJPEG frame: minimum size, SOI at the start, EOI
/// within the last 32 bytes.
pub fn validate_mjpeg(data: &[u8]) -> FrameValidation {
    if data.len() < MIN_MJPEG_FRAME_SIZE {
        return FrameValidation::Truncated;
    }
    if data[0] != 0xFF || data[1] != 0xD8 {
        return FrameValidation::NoSoi;
    }
    let search_start = data.len().saturating_sub(32);
    let found_eoi = data[search_start..]
        .windows(2)
        .any(|w| w == [0xFF, 0xD9]);
    if !found_eoi {
        return FrameValidation::NoEoi;
    }
    FrameValidation::Valid
}

/// Validates an assembled YUY2 frame against the negotiated dimensions.
/// After the deframer's padding rule a valid frame is exactly
/// `width * height * 2` bytes; anything under the 90% floor is incomplete.
pub fn validate_yuy2(data: &[u8], width: u32, height: u32) -> FrameValidation {
    let expected = width as usize * height as usize * 2;
    if data.len() < expected * MIN_YUY2_FRAME_PERCENT / 100 {
        return FrameValidation::Incomplete;
    }
    FrameValidation::Valid
}

/// Validation counters for one streaming session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationStats {
    pub validated: u64,
    pub valid: u64,
    pub incomplete: u64,
    pub no_soi: u64,
    pub no_eoi: u64,
    pub truncated: u64,
    pub repeated: u64,
    pub consecutive_bad: u32,
}

impl ValidationStats {
    /// Folds one validation outcome into the counters.
    pub fn record(&mut self, validation: FrameValidation) {
        self.validated += 1;
        match validation {
            FrameValidation::Valid => {
                self.valid += 1;
                self.consecutive_bad = 0;
            }
            FrameValidation::Incomplete => {
                self.incomplete += 1;
                self.bump_bad();
            }
            FrameValidation::NoSoi => {
                self.no_soi += 1;
                self.bump_bad();
            }
            FrameValidation::NoEoi => {
                self.no_eoi += 1;
                self.bump_bad();
            }
            FrameValidation::Truncated => {
                self.truncated += 1;
                self.bump_bad();
            }
        }
    }

    fn bump_bad(&mut self) {
        self.consecutive_bad += 1;
        if self.consecutive_bad == MAX_CONSECUTIVE_BAD_FRAMES {
            warn!(
                count = self.consecutive_bad,
                "consecutive invalid frames, consider a lower resolution"
            );
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.incomplete + self.no_soi + self.no_eoi + self.truncated
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Rate-limits validation stat reporting to one line per 30 s, and only when
/// something went wrong.
#[derive(Debug)]
pub struct ValidationReporter {
    last_report: Instant,
}

impl Default for ValidationReporter {
    fn default() -> Self {
        Self {
            last_report: Instant::now(),
        }
    }
}

impl ValidationReporter {
    pub fn maybe_report(&mut self, stats: &ValidationStats) {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        if stats.total_errors() > 0 {
            info!(
                valid = stats.valid,
                incomplete = stats.incomplete,
                no_soi = stats.no_soi,
                no_eoi = stats.no_eoi,
                truncated = stats.truncated,
                repeated = stats.repeated,
                "frame validation stats"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mjpeg_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[0] = 0xFF;
        frame[1] = 0xD8;
        frame[len - 2] = 0xFF;
        frame[len - 1] = 0xD9;
        frame
    }

    #[test]
    fn well_formed_mjpeg_is_valid() {
        assert_eq!(validate_mjpeg(&mjpeg_frame(2048)), FrameValidation::Valid);
    }

    #[test]
    fn eoi_found_anywhere_in_last_32_bytes() {
        let mut frame = mjpeg_frame(2048);
        // Move EOI a few bytes before the end (trailing padding).
        frame[2046] = 0;
        frame[2047] = 0;
        frame[2030] = 0xFF;
        frame[2031] = 0xD9;
        assert_eq!(validate_mjpeg(&frame), FrameValidation::Valid);
    }

    #[test]
    fn mjpeg_classification() {
        assert_eq!(validate_mjpeg(&[0xFF; 100]), FrameValidation::Truncated);

        let mut no_soi = mjpeg_frame(2048);
        no_soi[0] = 0x00;
        assert_eq!(validate_mjpeg(&no_soi), FrameValidation::NoSoi);

        let mut no_eoi = mjpeg_frame(2048);
        no_eoi[2046] = 0;
        no_eoi[2047] = 0;
        assert_eq!(validate_mjpeg(&no_eoi), FrameValidation::NoEoi);
    }

    #[test]
    fn yuy2_ninety_percent_floor() {
        let expected = 64 * 48 * 2;
        assert_eq!(
            validate_yuy2(&vec![0u8; expected], 64, 48),
            FrameValidation::Valid
        );
        assert_eq!(
            validate_yuy2(&vec![0u8; expected * 9 / 10], 64, 48),
            FrameValidation::Valid
        );
        assert_eq!(
            validate_yuy2(&vec![0u8; expected * 8 / 10], 64, 48),
            FrameValidation::Incomplete
        );
    }

    #[test]
    fn consecutive_bad_resets_on_valid() {
        let mut stats = ValidationStats::default();
        stats.record(FrameValidation::NoSoi);
        stats.record(FrameValidation::NoEoi);
        assert_eq!(stats.consecutive_bad, 2);
        stats.record(FrameValidation::Valid);
        assert_eq!(stats.consecutive_bad, 0);
        assert_eq!(stats.total_errors(), 2);
        assert_eq!(stats.validated, 3);
    }
}
