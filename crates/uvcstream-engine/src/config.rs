//! Tuning constants and environment overrides.

use std::env;
use std::time::Duration;

use tracing::Level;

// Transfer geometry.
pub const VIDEO_PACKETS_PER_TRANSFER: usize = 32;

// Packet-loss thresholds.
pub const PACKET_LOSS_WARNING_PERCENT: f32 = 5.0;
pub const PACKET_LOSS_ACTION_PERCENT: f32 = 10.0;
pub const MIN_PACKETS_FOR_STATS: u64 = 100;
pub const STATS_WINDOW: Duration = Duration::from_secs(5);
pub const RECOVERY_DELAY: Duration = Duration::from_secs(30);

// Consecutive whole-transfer failure rungs.
pub const CONSECUTIVE_FAILURES_WARN: u32 = 10;
pub const CONSECUTIVE_FAILURES_PAUSE: u32 = 50;
pub const FAILURE_PAUSE: Duration = Duration::from_millis(10);
pub const HIGH_BANDWIDTH_FAILURE_THRESHOLD: u32 = 5;

// Reporting and log throttling.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(30);
pub const LOG_THROTTLE_INTERVAL: u64 = 1000;
pub const LOG_TIME_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INITIAL_LOGS: u64 = 5;

// Delivery timing.
pub const WAIT_FRAME_TIMEOUT: Duration = Duration::from_secs(2);
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(50);

// MJPEG bandwidth starvation detection: average over 30-frame batches must
// stay above 30% of (raw size / 20).
pub const MJPEG_SIZE_BATCH: u32 = 30;
pub const MJPEG_SIZE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const MJPEG_MIN_SIZE_DIVISOR: usize = 20;
pub const MJPEG_MIN_AVG_PERCENT: usize = 30;

/// Verbosity levels accepted through `WEBCAM_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    None,
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Trace,
}

impl DebugLevel {
    /// Accepts the level names, the digits 0-5, and — like `atoi` — any
    /// string whose leading digits land in range (`"05"`, `"3x"`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Some(DebugLevel::None),
            "error" | "1" => Some(DebugLevel::Error),
            "warn" | "2" => Some(DebugLevel::Warn),
            "info" | "3" => Some(DebugLevel::Info),
            "verbose" | "4" => Some(DebugLevel::Verbose),
            "trace" | "5" => Some(DebugLevel::Trace),
            _ => Self::from_level(atoi(value)),
        }
    }

    fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(DebugLevel::None),
            1 => Some(DebugLevel::Error),
            2 => Some(DebugLevel::Warn),
            3 => Some(DebugLevel::Info),
            4 => Some(DebugLevel::Verbose),
            5 => Some(DebugLevel::Trace),
            _ => None,
        }
    }

    /// The tracing level filter an adapter should install; `None` silences
    /// everything.
    pub fn tracing_level(self) -> Option<Level> {
        match self {
            DebugLevel::None => None,
            DebugLevel::Error => Some(Level::ERROR),
            DebugLevel::Warn => Some(Level::WARN),
            DebugLevel::Info => Some(Level::INFO),
            DebugLevel::Verbose => Some(Level::DEBUG),
            DebugLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Environment-variable overrides, read once at session construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOverrides {
    pub debug_level: DebugLevel,
    /// Start at the lowest resolution.
    pub safe_mode: bool,
    /// Never pick a high-bandwidth alternate.
    pub disable_high_bandwidth: bool,
    /// Pick high-bandwidth alternates regardless of earlier failures.
    pub force_high_bandwidth: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            debug_level: env::var("WEBCAM_DEBUG")
                .ok()
                .and_then(|v| DebugLevel::parse(&v))
                .unwrap_or_default(),
            safe_mode: flag("WEBCAM_SAFE_MODE"),
            disable_high_bandwidth: flag("WEBCAM_DISABLE_HIGH_BANDWIDTH"),
            force_high_bandwidth: flag("WEBCAM_FORCE_HIGH_BANDWIDTH"),
        }
    }
}

fn flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("yes") | Ok("true")
    )
}

/// C `atoi` semantics: optional leading whitespace and sign, then as many
/// digits as follow; a string with no leading digits parses as 0.
fn atoi(value: &str) -> i64 {
    let mut chars = value.trim_start().chars().peekable();
    let mut sign = 1i64;
    if let Some(&c) = chars.peek() {
        if c == '+' || c == '-' {
            if c == '-' {
                sign = -1;
            }
            chars.next();
        }
    }
    let mut result = 0i64;
    for c in chars {
        let Some(digit) = c.to_digit(10) else {
            break;
        };
        result = result.saturating_mul(10).saturating_add(i64::from(digit));
    }
    sign * result
}
