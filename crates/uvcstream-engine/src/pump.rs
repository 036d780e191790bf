//! Video transfer pump.
//!
//! A dedicated thread submits isochronous (or bulk) IN transfers and feeds
//! every good packet straight into the deframer. Whole-transfer failures are
//! tolerated indefinitely; only a disconnect ends the loop. Packet-level
//! loss is counted, never retried.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use uvcstream_frame::Deframer;
use uvcstream_usb::{ErrorHistogram, IsoPacket, UsbBulkEndpoint, UsbIsoEndpoint};

use crate::config::{
    CONSECUTIVE_FAILURES_PAUSE, CONSECUTIVE_FAILURES_WARN, FAILURE_PAUSE, LOG_THROTTLE_INTERVAL,
    LOG_TIME_INTERVAL, MAX_INITIAL_LOGS, PACKET_LOSS_WARNING_PERCENT, STATS_REPORT_INTERVAL,
    VIDEO_PACKETS_PER_TRANSFER,
};
use crate::negotiate::HighBandwidthState;
use crate::stats::TransportStats;
use crate::StreamError;

/// The endpoint flavor a session streams over.
pub enum VideoEndpoint {
    Iso(Box<dyn UsbIsoEndpoint>),
    Bulk(Box<dyn UsbBulkEndpoint>),
}

/// State shared between the pump thread and the session.
#[derive(Debug, Default)]
pub struct PumpShared {
    pub stats: TransportStats,
    pub consecutive_failures: AtomicU32,
    /// Set when the pump decided the session must restart (high-bandwidth
    /// demotion). The delivery path picks it up.
    pub restart_requested: AtomicBool,
    pub disconnected: AtomicBool,
}

/// Owns the pump thread for one streaming session.
pub struct VideoPump {
    thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    shared: Arc<PumpShared>,
    high_bandwidth: Arc<Mutex<HighBandwidthState>>,
}

impl VideoPump {
    pub fn new(shared: Arc<PumpShared>, high_bandwidth: Arc<Mutex<HighBandwidthState>>) -> Self {
        Self {
            thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            shared,
            high_bandwidth,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the transfer task; returns once it is running.
    pub fn start(
        &mut self,
        endpoint: VideoEndpoint,
        packet_size: u32,
        deframer: Arc<Deframer>,
    ) -> Result<(), StreamError> {
        if self.is_running() {
            return Err(StreamError::AlreadyStreaming);
        }

        self.shared.restart_requested.store(false, Ordering::SeqCst);
        self.shared.disconnected.store(false, Ordering::SeqCst);
        self.shared.consecutive_failures.store(0, Ordering::SeqCst);
        self.should_stop.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let should_stop = Arc::clone(&self.should_stop);
        let running = Arc::clone(&self.running);
        let shared = Arc::clone(&self.shared);
        let high_bandwidth = Arc::clone(&self.high_bandwidth);

        let handle = thread::Builder::new()
            .name("video-pump".into())
            .spawn(move || {
                match endpoint {
                    VideoEndpoint::Iso(endpoint) => iso_loop(
                        endpoint,
                        packet_size,
                        &deframer,
                        &shared,
                        &high_bandwidth,
                        &should_stop,
                    ),
                    VideoEndpoint::Bulk(endpoint) => {
                        bulk_loop(endpoint, packet_size, &deframer, &shared, &should_stop)
                    }
                }
                running.store(false, Ordering::SeqCst);
                debug!("video pump thread exiting");
            })
            .map_err(|e| StreamError::Internal(e.to_string()))?;

        self.thread = Some(handle);
        info!(packet_size, "video pump started");
        Ok(())
    }

    /// Signals the task and waits for a clean exit. The loop observes the
    /// flag between transfers, so the join completes within one transfer's
    /// latency.
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("video pump stopped");
    }
}

impl Drop for VideoPump {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Per-iteration bookkeeping shared by both transfer flavors.
struct FailureTracker<'a> {
    shared: &'a PumpShared,
    high_bandwidth: &'a Mutex<HighBandwidthState>,
    consecutive: u32,
}

impl<'a> FailureTracker<'a> {
    fn new(shared: &'a PumpShared, high_bandwidth: &'a Mutex<HighBandwidthState>) -> Self {
        Self {
            shared,
            high_bandwidth,
            consecutive: 0,
        }
    }

    /// A transfer produced no usable packet.
    fn record_failure(&mut self) {
        self.consecutive += 1;
        self.shared
            .consecutive_failures
            .store(self.consecutive, Ordering::Relaxed);

        if self.consecutive == CONSECUTIVE_FAILURES_WARN {
            warn!(count = self.consecutive, "consecutive transfer failures");
        }
        if self.consecutive >= CONSECUTIVE_FAILURES_PAUSE {
            warn!("sustained transfer failures, pausing briefly");
            thread::sleep(FAILURE_PAUSE);
            self.consecutive = 0;
            self.shared.consecutive_failures.store(0, Ordering::Relaxed);
        }

        let mut state = self.high_bandwidth.lock();
        if state.record_failure() {
            // High-bandwidth just went from unknown to broken: the session
            // must restart on a single-transaction alternate.
            self.shared.restart_requested.store(true, Ordering::SeqCst);
        }
    }

    fn record_success(&mut self) {
        if self.consecutive > 0 {
            self.consecutive = 0;
            self.shared.consecutive_failures.store(0, Ordering::Relaxed);
        }
        self.high_bandwidth.lock().record_success();
    }
}

fn iso_loop(
    mut endpoint: Box<dyn UsbIsoEndpoint>,
    packet_size: u32,
    deframer: &Deframer,
    shared: &PumpShared,
    high_bandwidth: &Mutex<HighBandwidthState>,
    should_stop: &AtomicBool,
) {
    let packet_count = VIDEO_PACKETS_PER_TRANSFER;
    let slot = packet_size as usize;
    let mut buffer = vec![0u8; slot * packet_count];
    info!(
        buffer = buffer.len(),
        packets = packet_count,
        slot,
        "isochronous loop entered"
    );

    let mut tracker = FailureTracker::new(shared, high_bandwidth);
    let mut histogram = ErrorHistogram::default();
    let mut transfers = 0u64;
    let mut last_log = Instant::now();
    let mut last_stats = Instant::now();

    while !should_stop.load(Ordering::SeqCst) {
        let mut packets = vec![IsoPacket::with_request_length(packet_size); packet_count];
        let result = endpoint.submit(&mut buffer, &mut packets);
        histogram.record(result.as_ref().err().map(|e| e.kind()));

        transfers += 1;
        let should_log = transfers <= MAX_INITIAL_LOGS
            || transfers % LOG_THROTTLE_INTERVAL == 0
            || last_log.elapsed() > LOG_TIME_INTERVAL;
        if should_log {
            last_log = Instant::now();
            debug!(
                transfer = transfers,
                ok = result.is_ok(),
                first_packet = packets[0].actual_length,
                "iso transfer"
            );
        }

        match result {
            Err(err) if err.is_fatal() => {
                warn!("video endpoint disconnected: {err}");
                shared.disconnected.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                // Whole-transfer failure: count every slot as lost and keep
                // going; isochronous streams are never retried.
                for _ in 0..packet_count {
                    shared.stats.record_packet_error();
                }
                tracker.record_failure();
                if tracker.consecutive == CONSECUTIVE_FAILURES_WARN {
                    let action = err
                        .kind()
                        .recommended_action()
                        .escalate(shared.stats.snapshot().loss_percent, tracker.consecutive);
                    warn!(?action, "recommended recovery for sustained failures");
                }
                continue;
            }
            Ok(_) => {}
        }

        // Packets land at fixed slot offsets regardless of how much the
        // preceding packets actually carried.
        let mut good_packets = 0u32;
        let mut bad_packets = 0u32;
        for (i, packet) in packets.iter().enumerate() {
            if !packet.status.is_ok() {
                shared.stats.record_packet_error();
                bad_packets += 1;
                continue;
            }
            let actual = packet.actual_length as usize;
            if actual == 0 {
                continue;
            }
            let offset = i * slot;
            if offset + actual > buffer.len() {
                shared.stats.record_packet_error();
                bad_packets += 1;
                continue;
            }
            deframer.write(&buffer[offset..offset + actual]);
            shared.stats.record_packet_ok();
            good_packets += 1;
        }

        // A transfer that completed but moved nothing usable behaves like a
        // failed transfer for recovery purposes.
        if good_packets > 0 {
            tracker.record_success();
        } else if bad_packets > 0 {
            tracker.record_failure();
        }

        if last_stats.elapsed() > STATS_REPORT_INTERVAL {
            last_stats = Instant::now();
            let snapshot = shared.stats.snapshot();
            info!(
                ok = snapshot.packets_ok,
                errors = snapshot.packets_error,
                loss_percent = snapshot.loss_percent,
                rate = snapshot.packets_per_second,
                transfer_error_rate = histogram.total_error_rate(),
                "usb transfer stats"
            );
            if snapshot.loss_percent > PACKET_LOSS_WARNING_PERCENT {
                warn!(
                    loss_percent = snapshot.loss_percent,
                    "high packet loss, frames may degrade"
                );
            }
        }
    }
}

fn bulk_loop(
    mut endpoint: Box<dyn UsbBulkEndpoint>,
    buffer_size: u32,
    deframer: &Deframer,
    shared: &PumpShared,
    should_stop: &AtomicBool,
) {
    let mut buffer = vec![0u8; buffer_size as usize];
    info!(buffer = buffer.len(), "bulk loop entered");

    let mut logged = 0u64;
    while !should_stop.load(Ordering::SeqCst) {
        match endpoint.transfer(&mut buffer) {
            Ok(len) if len > 0 => {
                deframer.write(&buffer[..len]);
                shared.stats.record_packet_ok();
            }
            Ok(_) => {}
            Err(err) if err.is_fatal() => {
                warn!("bulk endpoint disconnected: {err}");
                shared.disconnected.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                shared.stats.record_packet_error();
                logged += 1;
                if logged <= MAX_INITIAL_LOGS {
                    warn!("bulk transfer failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uvcstream_frame::FramePool;
    use uvcstream_usb::{PacketStatus, TransportError, TransportResult};

    struct OneFrameEndpoint {
        sent: bool,
    }

    impl UsbIsoEndpoint for OneFrameEndpoint {
        fn submit(
            &mut self,
            buffer: &mut [u8],
            packets: &mut [IsoPacket],
        ) -> TransportResult<usize> {
            if self.sent {
                thread::sleep(Duration::from_millis(1));
                for packet in packets.iter_mut() {
                    packet.actual_length = 0;
                    packet.status = PacketStatus::Ok;
                }
                return Ok(0);
            }
            self.sent = true;
            let slot = packets[0].request_length as usize;
            // Packet 0: 4 payload bytes, same FID. Packet 1: EOF.
            buffer[..6].copy_from_slice(&[0x02, 0x01, 1, 2, 3, 4]);
            packets[0].actual_length = 6;
            packets[0].status = PacketStatus::Ok;
            buffer[slot..slot + 2].copy_from_slice(&[0x02, 0x03]);
            packets[1].actual_length = 2;
            packets[1].status = PacketStatus::Ok;
            for packet in packets.iter_mut().skip(2) {
                packet.actual_length = 0;
                packet.status = PacketStatus::Ok;
            }
            Ok(8)
        }
    }

    struct AllErrorEndpoint;

    impl UsbIsoEndpoint for AllErrorEndpoint {
        fn submit(
            &mut self,
            _buffer: &mut [u8],
            packets: &mut [IsoPacket],
        ) -> TransportResult<usize> {
            thread::sleep(Duration::from_micros(200));
            for packet in packets.iter_mut() {
                packet.actual_length = 0;
                packet.status = PacketStatus::Failed(uvcstream_usb::ErrorKind::Crc);
            }
            Ok(0)
        }
    }

    struct DisconnectingEndpoint;

    impl UsbIsoEndpoint for DisconnectingEndpoint {
        fn submit(
            &mut self,
            _buffer: &mut [u8],
            _packets: &mut [IsoPacket],
        ) -> TransportResult<usize> {
            Err(TransportError::Disconnected)
        }
    }

    fn pump_parts() -> (Arc<PumpShared>, Arc<Mutex<HighBandwidthState>>, Arc<Deframer>) {
        let shared = Arc::new(PumpShared::default());
        let hb = Arc::new(Mutex::new(HighBandwidthState::default()));
        let deframer = Arc::new(Deframer::new(Arc::new(FramePool::new(12)), 4096, 8));
        (shared, hb, deframer)
    }

    #[test]
    fn packets_flow_into_the_deframer() {
        let (shared, hb, deframer) = pump_parts();
        deframer.set_expected_frame_size(8);

        let mut pump = VideoPump::new(Arc::clone(&shared), hb);
        pump.start(
            VideoEndpoint::Iso(Box::new(OneFrameEndpoint { sent: false })),
            64,
            Arc::clone(&deframer),
        )
        .unwrap();

        assert_eq!(deframer.wait_frame(Duration::from_secs(2)), Ok(()));
        pump.stop();

        let (frame, _) = deframer.get_frame().unwrap();
        // 4 payload bytes padded to the expected 8 with YUY2 black.
        assert_eq!(frame.as_slice(), &[1, 2, 3, 4, 0x00, 0x80, 0x00, 0x80]);
        assert!(shared.stats.success() >= 2);
        assert!(!shared.restart_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn all_error_transfers_demote_high_bandwidth() {
        let (shared, hb, deframer) = pump_parts();
        hb.lock().in_use = true;

        let mut pump = VideoPump::new(Arc::clone(&shared), Arc::clone(&hb));
        pump.start(
            VideoEndpoint::Iso(Box::new(AllErrorEndpoint)),
            64,
            deframer,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !shared.restart_requested.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        pump.stop();

        assert!(shared.restart_requested.load(Ordering::SeqCst));
        assert!(hb.lock().known_broken());
        assert!(shared.stats.errors() > 0);
    }

    #[test]
    fn disconnect_ends_the_loop() {
        let (shared, hb, deframer) = pump_parts();
        let mut pump = VideoPump::new(Arc::clone(&shared), hb);
        pump.start(
            VideoEndpoint::Iso(Box::new(DisconnectingEndpoint)),
            64,
            deframer,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pump.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!pump.is_running());
        assert!(shared.disconnected.load(Ordering::SeqCst));
        pump.stop();
    }

    struct BulkFrameEndpoint {
        sent: bool,
    }

    impl UsbBulkEndpoint for BulkFrameEndpoint {
        fn transfer(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
            if self.sent {
                thread::sleep(Duration::from_millis(1));
                return Err(TransportError::Timeout);
            }
            self.sent = true;
            buffer[..6].copy_from_slice(&[0x02, 0x01, 1, 2, 3, 4]);
            buffer[6..8].copy_from_slice(&[0x02, 0x03]);
            Ok(8)
        }
    }

    #[test]
    fn bulk_path_feeds_the_deframer() {
        let (shared, hb, deframer) = pump_parts();
        deframer.set_expected_frame_size(4);

        let mut pump = VideoPump::new(Arc::clone(&shared), hb);
        pump.start(
            VideoEndpoint::Bulk(Box::new(BulkFrameEndpoint { sent: false })),
            64,
            Arc::clone(&deframer),
        )
        .unwrap();

        assert_eq!(deframer.wait_frame(Duration::from_secs(2)), Ok(()));
        pump.stop();

        let (frame, _) = deframer.get_frame().unwrap();
        assert_eq!(frame.as_slice(), &[1, 2, 3, 4]);
        assert!(shared.stats.errors() > 0);
    }

    #[test]
    fn double_start_is_rejected() {
        let (shared, hb, deframer) = pump_parts();
        let mut pump = VideoPump::new(shared, hb);
        pump.start(
            VideoEndpoint::Iso(Box::new(OneFrameEndpoint { sent: false })),
            64,
            Arc::clone(&deframer),
        )
        .unwrap();
        let err = pump
            .start(
                VideoEndpoint::Iso(Box::new(OneFrameEndpoint { sent: false })),
                64,
                deframer,
            )
            .unwrap_err();
        assert!(matches!(err, StreamError::AlreadyStreaming));
        pump.stop();
    }
}
