//! Streaming session orchestration.
//!
//! `CameraSession` ties the pieces together: descriptor layout, probe/commit
//! and alternate selection, the transfer pump, the deframer, the decoder,
//! resolution fallback, controls, and the parallel audio path. The adapter
//! layer above calls `start_stream`, pulls frames with `next_frame` (or
//! `pull_frame`), and reads PCM with `read_audio`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use uvcstream_audio::{AudioPump, AudioRing, PcmFormat, AUDIO_RING_CAPACITY};
use uvcstream_decode::{Decoder, FrameValidation};
use uvcstream_frame::{Deframer, FramePool, WaitFrameError, FRAME_POOL_CAPACITY, MAX_QUEUED_FRAMES, MAX_RAW_FRAME_SIZE};
use uvcstream_proto::{DeviceLayout, FrameDescriptor, PixelFormat, StreamFormat};
use uvcstream_usb::UsbDevice;

use crate::config::{
    EnvOverrides, MJPEG_MIN_SIZE_DIVISOR, RESTART_SETTLE_DELAY, STATS_REPORT_INTERVAL,
    WAIT_FRAME_TIMEOUT,
};
use crate::controls::{ControlId, ControlSurface};
use crate::fallback::{FallbackConfig, FallbackController, FallbackDecision};
use crate::negotiate::{HighBandwidthState, Negotiator};
use crate::pump::{PumpShared, VideoEndpoint, VideoPump};
use crate::stats::{AudioSnapshot, FrameSnapshot, SessionEvent, SessionMetrics};
use crate::StreamError;

/// Per-session configuration.
pub struct SessionConfig {
    /// Repeat the last good frame when validation fails.
    pub frame_repeat: bool,
    /// Optional event channel for the adapter layer.
    pub events: Option<Sender<SessionEvent>>,
    pub env: EnvOverrides,
    pub fallback: FallbackConfig,
    pub max_queued_frames: usize,
    pub pool_capacity: usize,
    pub max_raw_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_repeat: true,
            events: None,
            env: EnvOverrides::default(),
            fallback: FallbackConfig::default(),
            max_queued_frames: MAX_QUEUED_FRAMES,
            pool_capacity: FRAME_POOL_CAPACITY,
            max_raw_frame_size: MAX_RAW_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            env: EnvOverrides::from_env(),
            ..Default::default()
        }
    }
}

/// Metadata returned with each delivered frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub validation: FrameValidation,
}

/// An owned decoded frame, for consumers that prefer allocation over a
/// caller-provided buffer.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// BGRA8888, stride = width * 4.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

/// One camera's streaming state.
pub struct CameraSession {
    device: Arc<dyn UsbDevice>,
    negotiator: Negotiator,
    controls: ControlSurface,
    deframer: Arc<Deframer>,
    decoder: Mutex<Decoder>,
    pump: Mutex<VideoPump>,
    pump_shared: Arc<PumpShared>,
    high_bandwidth: Arc<Mutex<HighBandwidthState>>,
    fallback: Mutex<FallbackController>,
    audio_pump: Mutex<AudioPump>,
    audio_ring: Arc<AudioRing>,
    format: Mutex<Option<StreamFormat>>,
    dims: Mutex<(u32, u32)>,
    prefer_mjpeg: bool,
    running: AtomicBool,
    started_at: Mutex<Instant>,
    last_metrics_emit: Mutex<Instant>,
    events: Option<Sender<SessionEvent>>,
    env: EnvOverrides,
}

impl CameraSession {
    /// Builds a session over an enumerated device. Parses the configuration
    /// descriptors, probes the control ranges, and selects the default
    /// format and resolution (lowest resolution in safe mode).
    pub fn new(device: Arc<dyn UsbDevice>, config: SessionConfig) -> Result<Self, StreamError> {
        let layout = DeviceLayout::parse(device.configuration())?;
        let prefer_mjpeg = !layout.streaming.mjpeg_frames.is_empty();
        info!(
            mjpeg_frames = layout.streaming.mjpeg_frames.len(),
            uncompressed_frames = layout.streaming.uncompressed_frames.len(),
            has_audio = layout.audio_format.is_some(),
            format = if prefer_mjpeg { "MJPEG" } else { "YUY2" },
            "device layout parsed"
        );

        let controls = ControlSurface::new(
            Arc::clone(&device),
            layout.control.processing_unit,
            layout.control.interface_number,
            layout.audio_control,
        );
        controls.populate();

        let frame_count = if prefer_mjpeg {
            layout.streaming.mjpeg_frames.len()
        } else {
            layout.streaming.uncompressed_frames.len()
        };
        let max_level = frame_count.saturating_sub(1);

        let high_bandwidth = Arc::new(Mutex::new(HighBandwidthState::default()));
        let pool = Arc::new(FramePool::new(config.pool_capacity));
        let deframer = Arc::new(Deframer::new(
            pool,
            config.max_raw_frame_size,
            config.max_queued_frames,
        ));
        let pump_shared = Arc::new(PumpShared::default());

        let session = Self {
            negotiator: Negotiator::new(
                Arc::clone(&device),
                layout,
                config.env,
                Arc::clone(&high_bandwidth),
            ),
            controls,
            deframer,
            decoder: Mutex::new(Decoder::new(config.frame_repeat)?),
            pump: Mutex::new(VideoPump::new(
                Arc::clone(&pump_shared),
                Arc::clone(&high_bandwidth),
            )),
            pump_shared,
            high_bandwidth,
            fallback: Mutex::new(FallbackController::new(config.fallback, max_level)),
            audio_pump: Mutex::new(AudioPump::new()),
            audio_ring: Arc::new(AudioRing::new(AUDIO_RING_CAPACITY)),
            format: Mutex::new(None),
            dims: Mutex::new((0, 0)),
            prefer_mjpeg,
            running: AtomicBool::new(false),
            started_at: Mutex::new(Instant::now()),
            last_metrics_emit: Mutex::new(Instant::now()),
            events: config.events,
            env: config.env,
            device,
        };

        let (width, height) = session.suggest_video_frame();
        session.accept_video_frame(width, height)?;
        Ok(session)
    }

    pub fn controls(&self) -> &ControlSurface {
        &self.controls
    }

    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_audio(&self) -> bool {
        self.negotiator.layout().audio_format.is_some()
    }

    /// Size of the BGRA buffer `next_frame` wants for the current format.
    pub fn decoded_frame_size(&self) -> usize {
        self.format
            .lock()
            .as_ref()
            .map(|f| f.decoded_frame_size())
            .unwrap_or(0)
    }

    fn frame_list(&self) -> &[FrameDescriptor] {
        let streaming = &self.negotiator.layout().streaming;
        if self.prefer_mjpeg {
            &streaming.mjpeg_frames
        } else {
            &streaming.uncompressed_frames
        }
    }

    /// The resolution the session would pick by itself: the smallest one in
    /// safe mode, the consumer-selected ladder entry otherwise.
    pub fn suggest_video_frame(&self) -> (u32, u32) {
        let frames = self.frame_list();
        if frames.is_empty() {
            return (320, 240);
        }
        if self.env.safe_mode {
            if let Some(smallest) = frames.iter().min_by_key(|f| f.pixels()) {
                info!(
                    width = smallest.width,
                    height = smallest.height,
                    "safe mode: starting at the lowest resolution"
                );
                return (smallest.width, smallest.height);
            }
        }
        let index = self
            .controls
            .selected_resolution_index()
            .min(frames.len() - 1);
        (frames[index].width, frames[index].height)
    }

    /// Locks in a resolution for the next streaming session. The deframer
    /// switches assembly mode here; the probe/commit happens at start.
    pub fn accept_video_frame(&self, width: u32, height: u32) -> Result<(), StreamError> {
        let (width, height) = if width == 0 || height == 0 {
            self.suggest_video_frame()
        } else {
            (width, height)
        };

        let descriptor = self
            .frame_list()
            .iter()
            .find(|f| f.width == width && f.height == height)
            .ok_or(StreamError::UnsupportedResolution { width, height })?;

        let streaming = &self.negotiator.layout().streaming;
        let (pixel_format, format_index) = if self.prefer_mjpeg {
            (
                PixelFormat::Mjpeg,
                streaming.mjpeg_format_index.unwrap_or(1),
            )
        } else {
            (
                PixelFormat::Yuy2,
                streaming.uncompressed_format_index.unwrap_or(1),
            )
        };

        let format = StreamFormat {
            pixel_format,
            width,
            height,
            frame_interval: descriptor.default_frame_interval,
            format_index,
            // The descriptor's own index, not the list position.
            frame_index: descriptor.frame_index,
        };

        match pixel_format {
            PixelFormat::Yuy2 => self
                .deframer
                .set_expected_frame_size(format.raw_frame_size()),
            PixelFormat::Mjpeg => self.deframer.set_expected_frame_size(0),
        }

        let changed = *self.dims.lock() != (width, height);
        if changed {
            self.decoder.lock().note_resolution_change();
        }
        *self.dims.lock() = (width, height);
        *self.format.lock() = Some(format);
        info!(width, height, ?pixel_format, frame_index = format.frame_index, "video frame accepted");
        Ok(())
    }

    /// Negotiates with the device and starts the transfer pump. Session
    /// counters restart from zero.
    #[instrument(name = "start_stream", skip(self))]
    pub fn start_stream(&self) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyStreaming);
        }
        let format = (*self.format.lock()).ok_or(StreamError::NotStreaming)?;

        let negotiated = self.negotiator.probe_and_commit(&format)?;
        let transport = self.negotiator.select_alternate(&negotiated)?;
        let endpoint = self.device.open_iso_in(transport.endpoint_address)?;

        *self.format.lock() = Some(negotiated.format);
        self.deframer.flush();
        self.deframer.reopen();

        // A fresh session starts with clean counters.
        self.pump_shared.stats.reset();
        self.deframer.reset_stats();
        self.decoder.lock().reset_stats();
        self.fallback.lock().reset_counters();

        self.pump.lock().start(
            VideoEndpoint::Iso(endpoint),
            transport.packet_size,
            Arc::clone(&self.deframer),
        )?;

        self.running.store(true, Ordering::SeqCst);
        *self.started_at.lock() = Instant::now();
        self.emit(SessionEvent::Started {
            width: negotiated.format.width,
            height: negotiated.format.height,
            mjpeg: negotiated.format.pixel_format == PixelFormat::Mjpeg,
        });
        Ok(())
    }

    /// Stops the pump and parks the interface on its zero-bandwidth
    /// alternate.
    #[instrument(name = "stop_stream", skip(self))]
    pub fn stop_stream(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pump.lock().stop();
        self.deframer.close();
        if let Err(err) = self.negotiator.select_idle_alternate() {
            warn!("failed to idle the streaming interface: {err}");
        }
        self.emit(SessionEvent::Stopped);
    }

    /// Delivers the next frame into `out` (BGRA, `decoded_frame_size()`
    /// bytes). Runs validation, fallback evaluation, and restart handling
    /// on the way.
    pub fn next_frame(&self, out: &mut [u8]) -> Result<FrameInfo, StreamError> {
        if !self.is_streaming() {
            return Err(StreamError::NotStreaming);
        }

        if self.pump_shared.disconnected.load(Ordering::SeqCst) {
            self.stop_stream();
            self.emit(SessionEvent::Disconnected);
            return Err(StreamError::Disconnected);
        }

        // High-bandwidth demotion requested by the pump: restart on a
        // single-transaction alternate at the same resolution.
        if self
            .pump_shared
            .restart_requested
            .swap(false, Ordering::SeqCst)
        {
            self.emit(SessionEvent::HighBandwidthDisabled);
            let (width, height) = *self.dims.lock();
            self.restart_with(width, height)?;
        }

        match self.deframer.wait_frame(WAIT_FRAME_TIMEOUT) {
            Ok(()) => {}
            Err(WaitFrameError::Closed) => return Err(StreamError::Stopped),
            Err(WaitFrameError::TimedOut) => {
                // Repeated timeouts under high-bandwidth usually mean the
                // host controller cannot do multi-transaction isochronous.
                let demoted = {
                    let mut hb = self.high_bandwidth.lock();
                    hb.in_use && hb.record_failure()
                };
                if demoted {
                    self.pump_shared
                        .restart_requested
                        .store(true, Ordering::SeqCst);
                }
                return Err(StreamError::FrameTimeout);
            }
        }

        let Some((frame, timestamp)) = self.deframer.get_frame() else {
            return Err(StreamError::FrameTimeout);
        };
        let format = (*self.format.lock()).ok_or(StreamError::NotStreaming)?;

        let raw_len = frame.len();
        let result = self.decoder.lock().decode(frame.as_slice(), &format, out);
        self.deframer.recycle(frame);
        let validation = result?;

        // MJPEG frames that shrink far below the plausible compressed size
        // are a bandwidth-starvation signal.
        if format.pixel_format == PixelFormat::Mjpeg {
            let expected_min = format.raw_frame_size() / MJPEG_MIN_SIZE_DIVISOR;
            let decision = self
                .fallback
                .lock()
                .record_mjpeg_frame_size(raw_len, expected_min);
            self.apply_fallback_decision(decision)?;
        }

        // Feed the loss window and act on it.
        {
            let mut fallback = self.fallback.lock();
            fallback.update_window(
                self.pump_shared.stats.success(),
                self.pump_shared.stats.errors(),
            );
            let decision = fallback.evaluate();
            drop(fallback);
            self.apply_fallback_decision(decision)?;
        }

        self.maybe_emit_metrics();

        Ok(FrameInfo {
            width: format.width,
            height: format.height,
            timestamp,
            validation,
        })
    }

    /// Allocation-friendly variant of [`next_frame`].
    pub fn pull_frame(&self) -> Result<DecodedFrame, StreamError> {
        let size = self.decoded_frame_size();
        let mut buffer = vec![0u8; size];
        let info = self.next_frame(&mut buffer)?;
        Ok(DecodedFrame {
            data: Bytes::from(buffer),
            width: info.width,
            height: info.height,
            timestamp: info.timestamp,
        })
    }

    fn apply_fallback_decision(&self, decision: FallbackDecision) -> Result<(), StreamError> {
        match decision {
            FallbackDecision::None => Ok(()),
            FallbackDecision::StepDown => {
                let level = {
                    let mut fallback = self.fallback.lock();
                    fallback.note_step_down();
                    fallback.current_level()
                };
                let (width, height) = self.resolution_at_level(level);
                self.restart_with(width, height)?;
                self.emit(SessionEvent::FallbackApplied {
                    level,
                    width,
                    height,
                });
                if self.fallback.lock().at_minimum() {
                    self.emit(SessionEvent::AtMinimumResolution);
                }
                Ok(())
            }
            FallbackDecision::Recover => {
                let level = {
                    let mut fallback = self.fallback.lock();
                    fallback.note_recovery();
                    fallback.current_level()
                };
                let (width, height) = self.resolution_at_level(level);
                self.restart_with(width, height)?;
                self.emit(SessionEvent::Recovered {
                    level,
                    width,
                    height,
                });
                Ok(())
            }
        }
    }

    fn resolution_at_level(&self, level: usize) -> (u32, u32) {
        let frames = self.frame_list();
        if frames.is_empty() {
            return (320, 240);
        }
        let index = level.min(frames.len() - 1);
        (frames[index].width, frames[index].height)
    }

    /// Stop, let the camera settle, re-accept, restart.
    fn restart_with(&self, width: u32, height: u32) -> Result<(), StreamError> {
        info!(width, height, "restarting stream");
        self.stop_stream();
        thread::sleep(RESTART_SETTLE_DELAY);
        self.accept_video_frame(width, height)?;
        self.start_stream()
    }

    /// Starts the microphone pump, if the device has one.
    pub fn start_audio(&self) -> Result<(), StreamError> {
        let audio = self
            .negotiator
            .layout()
            .audio_format
            .ok_or(StreamError::NoAudio)?;
        let transport = self.negotiator.select_audio_alternate()?;

        let format = PcmFormat {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            bits_per_sample: audio.bit_resolution,
        }
        .with_fallbacks();
        self.negotiator
            .set_audio_sample_rate(transport.endpoint_address, format.sample_rate)?;

        let endpoint = self.device.open_iso_in(transport.endpoint_address)?;
        self.audio_pump.lock().start(
            endpoint,
            transport.max_packet_size,
            format,
            Arc::clone(&self.audio_ring),
        )?;
        Ok(())
    }

    pub fn stop_audio(&self) {
        let mut pump = self.audio_pump.lock();
        if pump.is_running() {
            let _ = pump.stop();
        }
        if let Err(err) = self.negotiator.select_audio_idle_alternate() {
            warn!("failed to idle the audio interface: {err}");
        }
    }

    /// Copies up to `out.len()` PCM bytes from the microphone ring.
    pub fn read_audio(&self, out: &mut [u8]) -> usize {
        self.audio_ring.read(out)
    }

    /// Aggregates the per-component statistics into one report.
    pub fn metrics(&self) -> SessionMetrics {
        let deframer_stats = self.deframer.stats();
        let pool_stats = self.deframer.pool().stats();
        let validation = self.decoder.lock().validation_stats();
        let audio_stats = Arc::clone(self.audio_pump.lock().stats());
        let audio = AudioSnapshot {
            transfers: audio_stats.transfers.load(Ordering::Relaxed),
            transfer_errors: audio_stats.transfer_errors.load(Ordering::Relaxed),
            packets_copied: audio_stats.packets_copied.load(Ordering::Relaxed),
            ring_overflows: self.audio_ring.overflows(),
        };
        let fallback = self.fallback.lock();

        SessionMetrics {
            transport: self.pump_shared.stats.snapshot(),
            frames: FrameSnapshot {
                completed: deframer_stats.frames_completed,
                padded: deframer_stats.frames_padded,
                fid_changes: deframer_stats.fid_changes,
                queue_overflows: deframer_stats.queue_overflows,
                header_errors: deframer_stats.header_errors,
                validated: validation.validated,
                valid: validation.valid,
                invalid: validation.total_errors(),
                repeated: validation.repeated,
                pool_hits: pool_stats.hits,
                pool_misses: pool_stats.misses,
            },
            audio,
            fallback_level: fallback.current_level(),
            fallback_active: fallback.is_active(),
            uptime_seconds: self.started_at.lock().elapsed().as_secs(),
        }
    }

    /// The ladder index a consumer asked for through the control surface.
    pub fn apply_selected_resolution(&self) -> Result<(), StreamError> {
        let index = self.controls.selected_resolution_index();
        let frames = self.frame_list();
        if frames.is_empty() {
            return Err(StreamError::UnsupportedResolution {
                width: 0,
                height: 0,
            });
        }
        let descriptor = &frames[index.min(frames.len() - 1)];
        let (width, height) = (descriptor.width, descriptor.height);
        if self.is_streaming() {
            self.restart_with(width, height)
        } else {
            self.accept_video_frame(width, height)
        }
    }

    fn maybe_emit_metrics(&self) {
        let mut last = self.last_metrics_emit.lock();
        if last.elapsed() < STATS_REPORT_INTERVAL {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.emit(SessionEvent::Metrics(self.metrics()));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            if let Err(err) = events.try_send(event) {
                warn!("session event dropped: {err}");
            }
        }
    }

    /// A handle to the selected-resolution control for adapters that expose
    /// it as a parameter.
    pub fn select_resolution_index(&self, index: usize) -> Result<(), StreamError> {
        self.controls
            .set(ControlId::ResolutionIndex, index as i32)
            .map_err(StreamError::from)?;
        Ok(())
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop_stream();
        self.stop_audio();
    }
}
