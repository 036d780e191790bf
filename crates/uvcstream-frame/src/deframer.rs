//! UVC payload deframer.
//!
//! Consumes one payload packet per `write` call and reassembles whole frames.
//! Two assembly modes, switched by `set_expected_frame_size`:
//!
//! - fixed-size (YUY2): payload accumulates in a deframer-owned buffer,
//!   clipped to the expected byte count. A frame publishes when it reaches
//!   that count, or on EOF with black padding so every published frame has
//!   the exact raw size the color converter's row stride math relies on.
//! - marker-delimited (MJPEG, expected size 0): payload accumulates in a
//!   pool buffer and publishes on FID toggle or EOF; the JPEG stream carries
//!   its own termination.
//!
//! Malformed packets are dropped and counted, never surfaced as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use uvcstream_proto::PayloadHeader;

use crate::{FrameBuffer, FramePool, FrameQueue, WaitFrameError};

/// YUY2 black: Y=0, U=V=128, repeated per macro-pixel.
const YUY2_BLACK: [u8; 4] = [0x00, 0x80, 0x00, 0x80];

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_INITIAL_LOGS: u64 = 5;

/// Deframer counters, snapshot via [`Deframer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeframerStats {
    pub frames_completed: u64,
    /// YUY2 frames that needed black padding to reach the expected size.
    pub frames_padded: u64,
    pub fid_changes: u64,
    pub queue_overflows: u64,
    pub header_errors: u64,
}

#[derive(Debug)]
struct ParserState {
    /// 0 selects marker-delimited (MJPEG) mode.
    expected_frame_size: usize,
    fid: bool,
    fid_initialized: bool,
    /// Fixed assembly buffer for YUY2; length is the write cursor.
    fixed: Vec<u8>,
    fixed_len: usize,
    /// Growable fill for MJPEG.
    current: Option<FrameBuffer>,
    packets_this_frame: u64,
    bytes_this_frame: usize,
    stats: DeframerStats,
    header_warnings: u64,
    mismatch_warnings: u64,
    error_bit_warnings: u64,
    last_report: Instant,
}

/// Reassembles UVC payload packets into whole frames.
pub struct Deframer {
    pool: Arc<FramePool>,
    queue: FrameQueue,
    state: Mutex<ParserState>,
}

impl Deframer {
    /// `max_frame_size` bounds the fixed YUY2 assembly buffer;
    /// `max_queued_frames` bounds the ready queue.
    pub fn new(pool: Arc<FramePool>, max_frame_size: usize, max_queued_frames: usize) -> Self {
        Self {
            pool,
            queue: FrameQueue::new(max_queued_frames),
            state: Mutex::new(ParserState {
                expected_frame_size: 0,
                fid: false,
                fid_initialized: false,
                fixed: vec![0; max_frame_size],
                fixed_len: 0,
                current: None,
                packets_this_frame: 0,
                bytes_this_frame: 0,
                stats: DeframerStats::default(),
                header_warnings: 0,
                mismatch_warnings: 0,
                error_bit_warnings: 0,
                last_report: Instant::now(),
            }),
        }
    }

    /// Selects the assembly mode: nonzero for fixed-size (YUY2) frames of
    /// exactly that many bytes, 0 for marker-delimited (MJPEG).
    pub fn set_expected_frame_size(&self, size: usize) {
        let mut state = self.state.lock();
        debug_assert!(size <= state.fixed.len());
        state.expected_frame_size = size.min(state.fixed.len());
        info!(size, "expected frame size set");
    }

    /// Feeds one UVC payload packet. Returns the bytes consumed:
    /// `packet.len()` normally, 0 when the packet header was rejected (state
    /// is untouched in that case).
    pub fn write(&self, packet: &[u8]) -> usize {
        let mut state = self.state.lock();
        state.packets_this_frame += 1;

        let header = match PayloadHeader::parse(packet) {
            Ok(header) => header,
            Err(err) => {
                state.stats.header_errors += 1;
                state.header_warnings += 1;
                if state.header_warnings <= MAX_INITIAL_LOGS {
                    warn!("invalid payload header: {err}");
                }
                return 0;
            }
        };

        if header.header_length != header.expected_length() {
            state.mismatch_warnings += 1;
            if state.mismatch_warnings <= MAX_INITIAL_LOGS {
                warn!(
                    claimed = header.header_length,
                    expected = header.expected_length(),
                    "payload header length disagrees with its flag bits"
                );
            }
        }

        if header.error_bit() {
            state.error_bit_warnings += 1;
            if state.error_bit_warnings <= MAX_INITIAL_LOGS {
                warn!("device set the payload error bit");
            }
        }

        let payload = header.payload(packet);
        let eof = header.end_of_frame();

        let fid_changed = state.fid_initialized && header.fid() != state.fid;
        if !state.fid_initialized {
            state.fid = header.fid();
            state.fid_initialized = true;
        }

        if fid_changed {
            state.fid = header.fid();
            state.stats.fid_changes += 1;
            if state.expected_frame_size == 0 {
                // A toggle closes the previous MJPEG frame.
                self.publish_mjpeg(&mut state);
            } else {
                // An incomplete YUY2 fill is dropped, never published short.
                state.fixed_len = 0;
            }
            state.packets_this_frame = 1;
            state.bytes_this_frame = 0;
        }

        if payload.is_empty() {
            // Header-only packet: the fill must not advance, but a trailing
            // EOF still finalizes whatever has accumulated.
            if eof && !fid_changed {
                self.finalize_current(&mut state);
            }
            self.maybe_report(&mut state);
            return packet.len();
        }

        state.bytes_this_frame += payload.len();

        if state.expected_frame_size > 0 {
            self.write_fixed(&mut state, payload, eof);
        } else {
            self.write_marker_delimited(&mut state, payload, eof, fid_changed);
        }

        self.maybe_report(&mut state);
        packet.len()
    }

    /// Blocks until a frame is ready, the stream stops, or `timeout` passes.
    pub fn wait_frame(&self, timeout: Duration) -> Result<(), WaitFrameError> {
        self.queue.wait(timeout)
    }

    /// Takes the oldest ready frame, transferring ownership to the caller.
    pub fn get_frame(&self) -> Option<(FrameBuffer, Instant)> {
        self.queue.pop().map(|frame| {
            let stamp = frame.stamp();
            (frame, stamp)
        })
    }

    /// Returns a consumed frame to the pool.
    pub fn recycle(&self, frame: FrameBuffer) {
        self.pool.release(frame);
    }

    /// Drops pending frames and resets parser state. Used at resolution
    /// change; the queue stays open.
    pub fn flush(&self) {
        for frame in self.queue.drain() {
            self.pool.release(frame);
        }
        let mut state = self.state.lock();
        state.fixed_len = 0;
        state.fid_initialized = false;
        state.packets_this_frame = 0;
        state.bytes_this_frame = 0;
        if let Some(frame) = state.current.take() {
            self.pool.release(frame);
        }
        info!(
            completed = state.stats.frames_completed,
            padded = state.stats.frames_padded,
            "deframer flushed"
        );
    }

    /// Wakes any frame waiter with `Closed`. Used on stream stop.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Re-arms the queue for a new streaming session.
    pub fn reopen(&self) {
        self.queue.reopen();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn stats(&self) -> DeframerStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.stats = DeframerStats::default();
        state.last_report = Instant::now();
    }

    /// Fixed-size path: append clipped payload, finish on size or EOF.
    fn write_fixed(&self, state: &mut ParserState, payload: &[u8], eof: bool) {
        let expected = state.expected_frame_size;
        let space_left = expected.saturating_sub(state.fixed_len);
        let take = payload.len().min(space_left);
        if take > 0 {
            let start = state.fixed_len;
            state.fixed[start..start + take].copy_from_slice(&payload[..take]);
            state.fixed_len += take;
        }

        if eof {
            self.finalize_fixed(state);
        } else if state.fixed_len >= expected {
            self.publish_fixed(state, false);
        }
    }

    /// EOF on a fixed-size frame: pad the remainder with YUY2 black so row
    /// alignment survives, then publish.
    fn finalize_fixed(&self, state: &mut ParserState) {
        if state.fixed_len == 0 {
            return;
        }
        let expected = state.expected_frame_size;
        let padded = state.fixed_len < expected;
        if padded {
            let missing = expected - state.fixed_len;
            debug!(
                missing,
                percent = 100.0 * state.fixed_len as f32 / expected as f32,
                "padding short frame"
            );
            while state.fixed_len < expected {
                let remaining = expected - state.fixed_len;
                let chunk = remaining.min(YUY2_BLACK.len());
                let start = state.fixed_len;
                state.fixed[start..start + chunk].copy_from_slice(&YUY2_BLACK[..chunk]);
                state.fixed_len += chunk;
            }
        }
        self.publish_fixed(state, padded);
    }

    fn publish_fixed(&self, state: &mut ParserState, padded: bool) {
        let expected = state.expected_frame_size;
        debug_assert_eq!(state.fixed_len, expected);

        if self.queue.is_full() {
            state.stats.queue_overflows += 1;
            state.fixed_len = 0;
            return;
        }

        let mut frame = self.pool.acquire();
        frame.fill_from(&state.fixed[..expected]);
        match self.queue.try_push(frame) {
            Ok(()) => {
                state.stats.frames_completed += 1;
                if padded {
                    state.stats.frames_padded += 1;
                }
            }
            Err(frame) => {
                state.stats.queue_overflows += 1;
                self.pool.release(frame);
            }
        }
        state.fixed_len = 0;
        state.packets_this_frame = 0;
    }

    /// Marker-delimited path: grow the fill, finish on EOF.
    fn write_marker_delimited(
        &self,
        state: &mut ParserState,
        payload: &[u8],
        eof: bool,
        fid_changed: bool,
    ) {
        if state.current.is_none() {
            if self.queue.is_full() {
                // Back-pressure: keep parsing, drop this frame's payload.
                state.stats.queue_overflows += 1;
                return;
            }
            state.current = Some(self.pool.acquire());
        }
        if let Some(frame) = state.current.as_mut() {
            frame.write(payload);
        }

        // An EOF on the same packet whose FID flipped belongs to the frame
        // that toggle already closed.
        if eof && !fid_changed {
            self.publish_mjpeg(state);
        }
    }

    fn finalize_current(&self, state: &mut ParserState) {
        if state.expected_frame_size > 0 {
            self.finalize_fixed(state);
        } else {
            self.publish_mjpeg(state);
        }
    }

    fn publish_mjpeg(&self, state: &mut ParserState) {
        let Some(frame) = state.current.take() else {
            return;
        };
        if frame.is_empty() {
            self.pool.release(frame);
            return;
        }
        match self.queue.try_push(frame) {
            Ok(()) => state.stats.frames_completed += 1,
            Err(frame) => {
                state.stats.queue_overflows += 1;
                self.pool.release(frame);
            }
        }
        state.packets_this_frame = 0;
    }

    fn maybe_report(&self, state: &mut ParserState) {
        if state.last_report.elapsed() < STATS_REPORT_INTERVAL {
            return;
        }
        state.last_report = Instant::now();
        let stats = state.stats;
        if stats.frames_completed > 0 || stats.frames_padded > 0 {
            info!(
                completed = stats.frames_completed,
                padded = stats.frames_padded,
                fid_changes = stats.fid_changes,
                overflows = stats.queue_overflows,
                "deframer stats"
            );
        }
    }
}
