//! Audio transfer pump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use uvcstream_usb::{IsoPacket, UsbIsoEndpoint};

use crate::{AudioError, AudioResult, AudioRing, PcmFormat, AUDIO_PACKETS_PER_TRANSFER};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_millis(10);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Counters shared between the pump thread and its owner.
#[derive(Debug, Default)]
pub struct AudioPumpStats {
    pub transfers: AtomicU64,
    pub transfer_errors: AtomicU64,
    pub packets_copied: AtomicU64,
}

/// Drives isochronous IN transfers on the audio endpoint and feeds the ring.
///
/// One pump per streaming session; `start` hands the endpoint to a dedicated
/// thread, `stop` signals it and joins. The thread checks the stop flag
/// between transfers, so the join is prompt.
pub struct AudioPump {
    thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<AudioPumpStats>,
}

impl Default for AudioPump {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPump {
    pub fn new() -> Self {
        Self {
            thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AudioPumpStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<AudioPumpStats> {
        &self.stats
    }

    /// Spawns the pump thread over an opened endpoint.
    pub fn start(
        &mut self,
        endpoint: Box<dyn UsbIsoEndpoint>,
        max_packet_size: u32,
        format: PcmFormat,
        ring: Arc<AudioRing>,
    ) -> AudioResult<()> {
        if self.is_running() {
            return Err(AudioError::AlreadyStarted);
        }

        let format = format.with_fallbacks();
        info!(
            rate = format.sample_rate,
            channels = format.channels,
            bits = format.bits_per_sample,
            max_packet_size,
            "starting audio pump"
        );

        self.should_stop.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let should_stop = Arc::clone(&self.should_stop);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("audio-pump".into())
            .spawn(move || {
                pump_loop(endpoint, max_packet_size, format, ring, &should_stop, &stats);
                running.store(false, Ordering::SeqCst);
                debug!("audio pump thread exiting");
            })
            .map_err(|e| AudioError::Transport(uvcstream_usb::TransportError::Unknown(e.to_string())))?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Signals the pump thread and waits for it to exit.
    pub fn stop(&mut self) -> AudioResult<()> {
        if self.thread.is_none() {
            return Err(AudioError::NotStarted);
        }
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("audio pump stopped");
        Ok(())
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn pump_loop(
    mut endpoint: Box<dyn UsbIsoEndpoint>,
    max_packet_size: u32,
    format: PcmFormat,
    ring: Arc<AudioRing>,
    should_stop: &AtomicBool,
    stats: &AudioPumpStats,
) {
    let mut bytes_per_packet = format.bytes_per_ms();
    if bytes_per_packet == 0 {
        bytes_per_packet = 192;
    }
    bytes_per_packet = bytes_per_packet.min(max_packet_size);

    let packet_count = AUDIO_PACKETS_PER_TRANSFER;
    let mut buffer = vec![0u8; bytes_per_packet as usize * packet_count];
    debug!(bytes_per_packet, packet_count, "audio pump loop entered");

    let mut consecutive_errors = 0u32;
    let mut backoff = RETRY_INITIAL_BACKOFF;
    let mut window_transfers = 0u64;
    let mut window_errors = 0u64;
    let mut last_report = Instant::now();

    while !should_stop.load(Ordering::SeqCst) {
        let mut packets = vec![IsoPacket::with_request_length(bytes_per_packet); packet_count];

        // Whole-transfer retry with short doubling backoff.
        let mut attempt = 0;
        let result = loop {
            match endpoint.submit(&mut buffer, &mut packets) {
                Ok(len) => break Ok(len),
                Err(err) if err.is_fatal() => break Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS || should_stop.load(Ordering::SeqCst) {
                        break Err(err);
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                }
            }
        };

        stats.transfers.fetch_add(1, Ordering::Relaxed);
        window_transfers += 1;

        match result {
            Err(err) if err.is_fatal() => {
                warn!("audio endpoint gone: {err}");
                break;
            }
            Err(_) => {
                stats.transfer_errors.fetch_add(1, Ordering::Relaxed);
                window_errors += 1;
                consecutive_errors += 1;
                if consecutive_errors == 10 || consecutive_errors == 100 {
                    warn!(consecutive_errors, "audio transfer errors");
                }
                thread::sleep(backoff);
                continue;
            }
            Ok(_) => {
                if consecutive_errors > 0 {
                    consecutive_errors = 0;
                    backoff = RETRY_INITIAL_BACKOFF;
                }
            }
        }

        // Copy completed packets from their fixed slots into the ring; a
        // full ring drops the packet and the ring counts the overflow.
        for (i, packet) in packets.iter().enumerate() {
            if !packet.status.is_ok() || packet.actual_length == 0 {
                continue;
            }
            let offset = i * bytes_per_packet as usize;
            let end = offset + packet.actual_length as usize;
            if end > buffer.len() {
                continue;
            }
            if ring.write(&buffer[offset..end]) {
                stats.packets_copied.fetch_add(1, Ordering::Relaxed);
            }
        }

        if last_report.elapsed() > STATS_INTERVAL {
            if window_errors > 0 {
                info!(
                    transfers = window_transfers,
                    errors = window_errors,
                    error_percent = 100.0 * window_errors as f32 / window_transfers as f32,
                    "audio pump stats"
                );
            }
            last_report = Instant::now();
            window_transfers = 0;
            window_errors = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcstream_usb::{PacketStatus, TransportError, TransportResult};

    /// Endpoint that produces a ramp of PCM bytes, then stalls forever.
    struct ScriptedEndpoint {
        transfers_left: u32,
        next_value: u8,
    }

    impl UsbIsoEndpoint for ScriptedEndpoint {
        fn submit(
            &mut self,
            buffer: &mut [u8],
            packets: &mut [IsoPacket],
        ) -> TransportResult<usize> {
            if self.transfers_left == 0 {
                thread::sleep(Duration::from_millis(1));
                return Err(TransportError::Timeout);
            }
            self.transfers_left -= 1;
            let slot = packets[0].request_length as usize;
            let mut total = 0;
            for (i, packet) in packets.iter_mut().enumerate() {
                let offset = i * slot;
                for b in &mut buffer[offset..offset + slot] {
                    *b = self.next_value;
                    self.next_value = self.next_value.wrapping_add(1);
                }
                packet.actual_length = packet.request_length;
                packet.status = PacketStatus::Ok;
                total += slot;
            }
            Ok(total)
        }
    }

    #[test]
    fn pump_fills_ring_and_stops_cleanly() {
        let ring = Arc::new(AudioRing::new(AUDIO_RING_CAPACITY_FOR_TEST));
        let mut pump = AudioPump::new();
        let endpoint = Box::new(ScriptedEndpoint {
            transfers_left: 2,
            next_value: 1,
        });
        let format = PcmFormat {
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 16,
        };
        // 8 kHz mono 16-bit: 16 bytes per packet, 16 packets per transfer.
        pump.start(endpoint, 512, format, Arc::clone(&ring)).unwrap();
        assert!(pump.is_running());

        // Two transfers of 256 bytes each.
        let mut out = vec![0u8; 512];
        let mut collected = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while collected < out.len() && Instant::now() < deadline {
            collected += ring.read(&mut out[collected..]);
        }
        assert_eq!(collected, 512);
        let mut expected = 0u8;
        for &byte in &out {
            expected = expected.wrapping_add(1);
            assert_eq!(byte, expected);
        }

        pump.stop().unwrap();
        assert!(!pump.is_running());
    }

    #[test]
    fn double_start_is_rejected() {
        let ring = Arc::new(AudioRing::new(AUDIO_RING_CAPACITY_FOR_TEST));
        let mut pump = AudioPump::new();
        pump.start(
            Box::new(ScriptedEndpoint {
                transfers_left: 0,
                next_value: 0,
            }),
            512,
            PcmFormat::FALLBACK,
            Arc::clone(&ring),
        )
        .unwrap();
        let err = pump
            .start(
                Box::new(ScriptedEndpoint {
                    transfers_left: 0,
                    next_value: 0,
                }),
                512,
                PcmFormat::FALLBACK,
                ring,
            )
            .unwrap_err();
        assert!(matches!(err, AudioError::AlreadyStarted));
        pump.stop().unwrap();
    }

    #[test]
    fn stop_without_start_errors() {
        let mut pump = AudioPump::new();
        assert!(matches!(pump.stop(), Err(AudioError::NotStarted)));
    }

    const AUDIO_RING_CAPACITY_FOR_TEST: usize = 4096;
}
