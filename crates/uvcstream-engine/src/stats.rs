//! Session statistics, split by concern and aggregated at report time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Per-packet transfer counters, updated from the pump thread.
#[derive(Debug)]
pub struct TransportStats {
    success: AtomicU64,
    errors: AtomicU64,
    started: Mutex<Instant>,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }
}

impl TransportStats {
    pub fn record_packet_ok(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.started.lock() = Instant::now();
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        let success = self.success();
        let errors = self.errors();
        let total = success + errors;
        let elapsed = self.started.lock().elapsed().as_secs_f32();
        TransportSnapshot {
            packets_ok: success,
            packets_error: errors,
            loss_percent: if total > 0 {
                100.0 * errors as f32 / total as f32
            } else {
                0.0
            },
            packets_per_second: if elapsed > 0.0 {
                total as f32 / elapsed
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time transfer statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportSnapshot {
    pub packets_ok: u64,
    pub packets_error: u64,
    pub loss_percent: f32,
    pub packets_per_second: f32,
}

/// Frame pipeline statistics: deframing plus validation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameSnapshot {
    pub completed: u64,
    pub padded: u64,
    pub fid_changes: u64,
    pub queue_overflows: u64,
    pub header_errors: u64,
    pub validated: u64,
    pub valid: u64,
    pub invalid: u64,
    pub repeated: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
}

/// Audio pipeline statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AudioSnapshot {
    pub transfers: u64,
    pub transfer_errors: u64,
    pub packets_copied: u64,
    pub ring_overflows: u64,
}

/// Everything an adapter wants in one periodic report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionMetrics {
    pub transport: TransportSnapshot,
    pub frames: FrameSnapshot,
    pub audio: AudioSnapshot,
    pub fallback_level: usize,
    pub fallback_active: bool,
    pub uptime_seconds: u64,
}

/// Out-of-band notifications for the adapter layer. Delivered best-effort
/// over a bounded channel; a slow adapter loses events, never frames.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    Started {
        width: u32,
        height: u32,
        mjpeg: bool,
    },
    Stopped,
    FallbackApplied {
        level: usize,
        width: u32,
        height: u32,
    },
    Recovered {
        level: usize,
        width: u32,
        height: u32,
    },
    HighBandwidthDisabled,
    AtMinimumResolution,
    Metrics(SessionMetrics),
    Disconnected,
}
