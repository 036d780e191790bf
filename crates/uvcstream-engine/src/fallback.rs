//! Resolution fallback controller.
//!
//! Watches packet loss over a sliding window and MJPEG frame sizes over
//! 30-frame batches, and decides when the session should step down the
//! resolution ladder or climb back up after a stable stretch. The decision
//! is returned to the session, which owns the restart sequencing.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{
    MIN_PACKETS_FOR_STATS, MJPEG_MIN_AVG_PERCENT, MJPEG_SIZE_BATCH, MJPEG_SIZE_CHECK_INTERVAL,
    PACKET_LOSS_ACTION_PERCENT, RECOVERY_DELAY, STATS_WINDOW,
};

/// Fallback policy knobs, defaulting to the shipped thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub loss_threshold_percent: f32,
    pub evaluation_interval: Duration,
    pub min_packets_for_eval: u64,
    pub auto_recovery: bool,
    pub recovery_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            loss_threshold_percent: PACKET_LOSS_ACTION_PERCENT,
            evaluation_interval: STATS_WINDOW,
            min_packets_for_eval: MIN_PACKETS_FOR_STATS,
            auto_recovery: true,
            recovery_delay: RECOVERY_DELAY,
        }
    }
}

/// What the controller wants the session to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    None,
    /// Step one ladder level down (lower resolution) and restart.
    StepDown,
    /// Step one ladder level up (higher resolution) and restart.
    Recover,
}

/// Sliding-window loss evaluation plus MJPEG starvation detection.
#[derive(Debug)]
pub struct FallbackController {
    config: FallbackConfig,
    max_level: usize,
    current_level: usize,
    active: bool,
    warned_at_minimum: bool,
    stable_since: Option<Instant>,
    window_started: Option<Instant>,
    window_packets: u64,
    window_errors: u64,
    last_success_total: u64,
    last_error_total: u64,
    mjpeg_size_sum: u64,
    mjpeg_size_count: u32,
    last_size_check: Instant,
}

impl FallbackController {
    /// `max_level` is the deepest ladder level (count - 1).
    pub fn new(config: FallbackConfig, max_level: usize) -> Self {
        Self {
            config,
            max_level,
            current_level: 0,
            active: false,
            warned_at_minimum: false,
            stable_since: None,
            window_started: None,
            window_packets: 0,
            window_errors: 0,
            last_success_total: 0,
            last_error_total: 0,
            mjpeg_size_sum: 0,
            mjpeg_size_count: 0,
            last_size_check: Instant::now(),
        }
    }

    pub fn current_level(&self) -> usize {
        self.current_level
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn at_minimum(&self) -> bool {
        self.current_level >= self.max_level
    }

    /// Starts a session at the given ladder level (safe mode starts low).
    pub fn set_level(&mut self, level: usize) {
        self.current_level = level.min(self.max_level);
        self.active = self.current_level > 0;
    }

    /// Feeds cumulative packet counters from the transport stats; the
    /// controller windows them internally by delta.
    pub fn update_window(&mut self, success_total: u64, error_total: u64) {
        let delta_success = success_total.saturating_sub(self.last_success_total);
        let delta_errors = error_total.saturating_sub(self.last_error_total);
        self.last_success_total = success_total;
        self.last_error_total = error_total;
        self.window_packets += delta_success + delta_errors;
        self.window_errors += delta_errors;
    }

    /// Evaluates the window. At most one decision per evaluation interval;
    /// windows with too few packets are discarded.
    pub fn evaluate(&mut self) -> FallbackDecision {
        let now = Instant::now();
        let Some(started) = self.window_started else {
            self.window_started = Some(now);
            self.window_packets = 0;
            self.window_errors = 0;
            return FallbackDecision::None;
        };
        if now.duration_since(started) < self.config.evaluation_interval {
            return FallbackDecision::None;
        }
        if self.window_packets < self.config.min_packets_for_eval {
            self.reset_window(now);
            return FallbackDecision::None;
        }

        let loss_percent = 100.0 * self.window_errors as f32 / self.window_packets as f32;
        let decision = if loss_percent > self.config.loss_threshold_percent {
            self.stable_since = None;
            self.request_step_down(loss_percent)
        } else {
            self.consider_recovery(now)
        };

        self.reset_window(now);
        decision
    }

    /// MJPEG frames far below the plausible compressed size mean the bus is
    /// starving the camera mid-frame. Checked every 30 frames, at most once
    /// per 5 s. `expected_min` is the resolution's minimum plausible size.
    pub fn record_mjpeg_frame_size(&mut self, size: usize, expected_min: usize) -> FallbackDecision {
        self.mjpeg_size_sum += size as u64;
        self.mjpeg_size_count += 1;
        if self.mjpeg_size_count < MJPEG_SIZE_BATCH
            || self.last_size_check.elapsed() < MJPEG_SIZE_CHECK_INTERVAL
        {
            return FallbackDecision::None;
        }

        let average = (self.mjpeg_size_sum / u64::from(self.mjpeg_size_count)) as usize;
        self.mjpeg_size_sum = 0;
        self.mjpeg_size_count = 0;
        self.last_size_check = Instant::now();

        if average < expected_min * MJPEG_MIN_AVG_PERCENT / 100 {
            warn!(
                average,
                expected_min, "MJPEG frames far below plausible size, bandwidth starved"
            );
            return self.request_step_down(0.0);
        }
        FallbackDecision::None
    }

    /// The session applied a step down.
    pub fn note_step_down(&mut self) {
        self.current_level = (self.current_level + 1).min(self.max_level);
        self.active = true;
        self.warned_at_minimum = false;
        self.stable_since = None;
        self.reset_counters();
        info!(level = self.current_level, "resolution fallback applied");
    }

    /// The session recovered one level.
    pub fn note_recovery(&mut self) {
        self.current_level = self.current_level.saturating_sub(1);
        if self.current_level == 0 {
            self.active = false;
        }
        self.stable_since = None;
        self.reset_counters();
        info!(level = self.current_level, "resolution recovery applied");
    }

    /// Session restart: counters go back to zero, the level stays.
    pub fn reset_counters(&mut self) {
        self.window_started = None;
        self.window_packets = 0;
        self.window_errors = 0;
        self.last_success_total = 0;
        self.last_error_total = 0;
        self.mjpeg_size_sum = 0;
        self.mjpeg_size_count = 0;
    }

    fn request_step_down(&mut self, loss_percent: f32) -> FallbackDecision {
        if self.at_minimum() {
            if !self.warned_at_minimum {
                warn!("already at minimum resolution, cannot fall back further");
                self.warned_at_minimum = true;
            }
            return FallbackDecision::None;
        }
        warn!(
            loss_percent,
            level = self.current_level,
            "packet loss above threshold, requesting resolution fallback"
        );
        FallbackDecision::StepDown
    }

    fn consider_recovery(&mut self, now: Instant) -> FallbackDecision {
        if !self.config.auto_recovery || self.current_level == 0 {
            self.stable_since = None;
            return FallbackDecision::None;
        }
        match self.stable_since {
            None => {
                self.stable_since = Some(now);
                FallbackDecision::None
            }
            Some(since) if now.duration_since(since) > self.config.recovery_delay => {
                info!(
                    level = self.current_level,
                    "link stable, attempting resolution recovery"
                );
                FallbackDecision::Recover
            }
            Some(_) => FallbackDecision::None,
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_started = Some(now);
        self.window_packets = 0;
        self.window_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> FallbackConfig {
        FallbackConfig {
            loss_threshold_percent: 10.0,
            evaluation_interval: Duration::from_millis(0),
            min_packets_for_eval: 100,
            auto_recovery: true,
            recovery_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn high_loss_triggers_step_down() {
        let mut controller = FallbackController::new(fast_config(), 3);
        assert_eq!(controller.evaluate(), FallbackDecision::None); // arms the window

        // 200 packets, 25 errors: 12.5% > 10%.
        controller.update_window(175, 25);
        assert_eq!(controller.evaluate(), FallbackDecision::StepDown);

        controller.note_step_down();
        assert_eq!(controller.current_level(), 1);
        assert!(controller.is_active());
    }

    #[test]
    fn low_loss_never_steps_down() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.evaluate();
        controller.update_window(195, 5); // 2.5%
        assert_eq!(controller.evaluate(), FallbackDecision::None);
        assert!(!controller.is_active());
    }

    #[test]
    fn too_few_packets_is_no_decision() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.evaluate();
        controller.update_window(30, 20); // 40% loss but only 50 packets
        assert_eq!(controller.evaluate(), FallbackDecision::None);
    }

    #[test]
    fn at_minimum_warns_once_and_stops() {
        let mut controller = FallbackController::new(fast_config(), 1);
        controller.set_level(1);
        controller.evaluate();
        controller.update_window(100, 50);
        assert_eq!(controller.evaluate(), FallbackDecision::None);
        assert!(controller.at_minimum());
    }

    #[test]
    fn stable_link_recovers_after_delay() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.set_level(2);

        controller.evaluate();
        controller.update_window(200, 0);
        // First clean window starts the stability clock.
        assert_eq!(controller.evaluate(), FallbackDecision::None);
        controller.update_window(400, 0);
        // Zero recovery delay in this config: second clean window recovers.
        assert_eq!(controller.evaluate(), FallbackDecision::Recover);

        controller.note_recovery();
        assert_eq!(controller.current_level(), 1);
        assert!(controller.is_active());
        controller.note_recovery();
        assert!(!controller.is_active());
    }

    #[test]
    fn loss_resets_the_stability_clock() {
        let config = FallbackConfig {
            recovery_delay: Duration::from_secs(3600),
            ..fast_config()
        };
        let mut controller = FallbackController::new(config, 3);
        controller.set_level(1);
        controller.evaluate();
        controller.update_window(200, 0);
        assert_eq!(controller.evaluate(), FallbackDecision::None);
        // Lossy window: stability clock must restart.
        controller.update_window(400, 100);
        assert_eq!(controller.evaluate(), FallbackDecision::StepDown);
        assert!(controller.stable_since.is_none());
    }

    #[test]
    fn starved_mjpeg_frames_request_step_down() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.last_size_check = Instant::now() - Duration::from_secs(6);

        // Expected minimum 10_000; frames average 1_000 (10% < 30%).
        let mut decision = FallbackDecision::None;
        for _ in 0..MJPEG_SIZE_BATCH {
            decision = controller.record_mjpeg_frame_size(1_000, 10_000);
        }
        assert_eq!(decision, FallbackDecision::StepDown);
    }

    #[test]
    fn healthy_mjpeg_sizes_pass() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.last_size_check = Instant::now() - Duration::from_secs(6);
        let mut decision = FallbackDecision::StepDown;
        for _ in 0..MJPEG_SIZE_BATCH {
            decision = controller.record_mjpeg_frame_size(8_000, 10_000);
        }
        assert_eq!(decision, FallbackDecision::None);
    }

    #[test]
    fn counters_reset_keeps_level() {
        let mut controller = FallbackController::new(fast_config(), 3);
        controller.set_level(2);
        controller.update_window(100, 10);
        controller.reset_counters();
        assert_eq!(controller.current_level(), 2);
        assert_eq!(controller.window_packets, 0);
    }
}
