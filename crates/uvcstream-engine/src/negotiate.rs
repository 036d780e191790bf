//! Format negotiation and alternate-setting selection.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use uvcstream_proto::consts::{
    MICROFRAMES_PER_SECOND, REQTYPE_CLASS_ENDPOINT_OUT, REQTYPE_CLASS_INTERFACE_IN,
    REQTYPE_CLASS_INTERFACE_OUT, REQTYPE_STANDARD_INTERFACE_OUT, REQUEST_SET_INTERFACE,
    RC_GET_CUR, RC_SET_CUR, SAMPLING_FREQ_CONTROL, VS_COMMIT_CONTROL, VS_PROBE_CONTROL,
};
use uvcstream_proto::{DeviceLayout, PixelFormat, ProbeCommit, ProtocolError, StreamFormat};
use uvcstream_usb::{TransportError, UsbDevice};

use crate::config::{EnvOverrides, HIGH_BANDWIDTH_FAILURE_THRESHOLD};

/// Errors surfaced by probe/commit and alternate selection. These reach the
/// caller of `start_stream`.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{stage}: short control transfer ({actual}/{expected} bytes)")]
    ShortControlTransfer {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("device zeroed the negotiated frame/payload sizes")]
    ZeroNegotiatedSizes,

    #[error("no usable isochronous alternate on the streaming interface")]
    NoUsableAlternate,

    #[error("device exposes no audio streaming interface")]
    NoAudioInterface,
}

/// Result of probe/commit: the device's accepted numbers.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub format: StreamFormat,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

/// The endpoint and bandwidth a streaming session runs over.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedTransport {
    pub endpoint_address: u8,
    pub alternate: u8,
    pub base_packet_size: u32,
    pub transactions_per_microframe: u32,
    /// Per-slot transfer size: base x transactions.
    pub packet_size: u32,
    pub high_bandwidth: bool,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

/// Audio endpoint selection result.
#[derive(Debug, Clone, Copy)]
pub struct AudioTransport {
    pub endpoint_address: u8,
    pub alternate: u8,
    pub max_packet_size: u32,
}

/// Tri-state memory of whether high-bandwidth isochronous transfers work on
/// this host controller. Unknown defaults to trying; a demotion sticks for
/// the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct HighBandwidthState {
    tested: bool,
    works: bool,
    failures: u32,
    /// True while the running session uses a multi-transaction alternate.
    pub in_use: bool,
}

impl Default for HighBandwidthState {
    fn default() -> Self {
        Self {
            tested: false,
            works: true,
            failures: 0,
            in_use: false,
        }
    }
}

impl HighBandwidthState {
    pub fn should_use(&self, env: &EnvOverrides) -> bool {
        if env.disable_high_bandwidth {
            return false;
        }
        if env.force_high_bandwidth {
            return true;
        }
        if self.tested && !self.works {
            return false;
        }
        true
    }

    pub fn known_broken(&self) -> bool {
        self.tested && !self.works
    }

    /// Records a whole-transfer failure. Returns true when this crossed the
    /// threshold and just demoted high-bandwidth to broken.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.in_use && !self.known_broken() && self.failures >= HIGH_BANDWIDTH_FAILURE_THRESHOLD
        {
            warn!(
                failures = self.failures,
                "disabling high-bandwidth isochronous mode"
            );
            self.tested = true;
            self.works = false;
            return true;
        }
        false
    }

    /// A successful transfer confirms the current mode works.
    pub fn record_success(&mut self) {
        self.failures = 0;
        if self.in_use && !self.tested {
            self.tested = true;
            self.works = true;
            info!("high-bandwidth mode confirmed working");
        }
    }
}

/// Drives probe/commit and alternate selection against the device.
pub struct Negotiator {
    device: Arc<dyn UsbDevice>,
    layout: DeviceLayout,
    env: EnvOverrides,
    high_bandwidth: Arc<Mutex<HighBandwidthState>>,
    current_video_alternate: Mutex<u8>,
    current_audio_alternate: Mutex<u8>,
}

impl Negotiator {
    pub fn new(
        device: Arc<dyn UsbDevice>,
        layout: DeviceLayout,
        env: EnvOverrides,
        high_bandwidth: Arc<Mutex<HighBandwidthState>>,
    ) -> Self {
        Self {
            device,
            layout,
            env,
            high_bandwidth,
            current_video_alternate: Mutex::new(0),
            current_audio_alternate: Mutex::new(0),
        }
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Two-phase UVC format negotiation. The commit phase echoes the
    /// device's probe response verbatim; the device may legally adjust any
    /// field during probe.
    pub fn probe_and_commit(
        &self,
        requested: &StreamFormat,
    ) -> Result<Negotiated, NegotiationError> {
        let version = self.layout.control.version;
        let block_len = version.control_block_len();
        let streaming_interface = u16::from(self.layout.streaming.interface_number);

        let frame_interval = self.adapt_frame_interval(requested);
        let request = ProbeCommit::request(
            requested.format_index,
            requested.frame_index,
            frame_interval,
        );
        info!(
            format_index = request.format_index,
            frame_index = request.frame_index,
            interval = request.frame_interval,
            "probe request"
        );

        let out = request.to_bytes(version);
        let written = self.device.control_out(
            REQTYPE_CLASS_INTERFACE_OUT,
            RC_SET_CUR,
            VS_PROBE_CONTROL,
            streaming_interface,
            &out,
        )?;
        if written != block_len {
            return Err(NegotiationError::ShortControlTransfer {
                stage: "probe SET_CUR",
                expected: block_len,
                actual: written,
            });
        }

        let mut response_bytes = vec![0u8; block_len];
        let read = self.device.control_in(
            REQTYPE_CLASS_INTERFACE_IN,
            RC_GET_CUR,
            VS_PROBE_CONTROL,
            streaming_interface,
            &mut response_bytes,
        )?;
        if read != block_len {
            return Err(NegotiationError::ShortControlTransfer {
                stage: "probe GET_CUR",
                expected: block_len,
                actual: read,
            });
        }
        let response = ProbeCommit::from_bytes(&response_bytes, version)?;

        if response.frame_index != request.frame_index {
            warn!(
                requested = request.frame_index,
                negotiated = response.frame_index,
                "device adjusted the frame index"
            );
        }
        if response.format_index != request.format_index {
            warn!(
                requested = request.format_index,
                negotiated = response.format_index,
                "device adjusted the format index"
            );
        }
        if response.max_video_frame_size == 0 || response.max_payload_transfer_size == 0 {
            return Err(NegotiationError::ZeroNegotiatedSizes);
        }

        // Commit the device's own numbers, not our request.
        let written = self.device.control_out(
            REQTYPE_CLASS_INTERFACE_OUT,
            RC_SET_CUR,
            VS_COMMIT_CONTROL,
            streaming_interface,
            &response.to_bytes(version),
        )?;
        if written != block_len {
            return Err(NegotiationError::ShortControlTransfer {
                stage: "commit SET_CUR",
                expected: block_len,
                actual: written,
            });
        }

        info!(
            max_video_frame_size = response.max_video_frame_size,
            max_payload = response.max_payload_transfer_size,
            interval = response.frame_interval,
            "commit accepted"
        );

        Ok(Negotiated {
            format: StreamFormat {
                frame_interval: response.frame_interval,
                format_index: response.format_index,
                frame_index: response.frame_index,
                ..*requested
            },
            max_video_frame_size: response.max_video_frame_size,
            max_payload_transfer_size: response.max_payload_transfer_size,
        })
    }

    /// For uncompressed streams, lowers the requested frame rate when the
    /// best available alternate cannot move raw frames that fast. 90% of the
    /// theoretical ceiling leaves headroom for header overhead.
    fn adapt_frame_interval(&self, requested: &StreamFormat) -> u32 {
        if requested.pixel_format != PixelFormat::Yuy2 {
            return requested.frame_interval;
        }
        let allow = self.allow_high_bandwidth();
        let bandwidth = self.max_available_bandwidth(allow);
        if bandwidth == 0 {
            return requested.frame_interval;
        }

        let frame_size = requested.raw_frame_size() as f32;
        let bytes_per_second = (bandwidth * MICROFRAMES_PER_SECOND) as f32;
        let max_fps = bytes_per_second / frame_size;
        let safe_fps = (max_fps * 0.9).max(1.0);
        let adapted = (10_000_000.0 / safe_fps) as u32;

        if adapted > requested.frame_interval {
            info!(
                bandwidth,
                requested_fps = requested.fps(),
                adapted_fps = safe_fps,
                "YUY2 frame rate lowered to fit bus bandwidth"
            );
            adapted
        } else {
            requested.frame_interval
        }
    }

    fn allow_high_bandwidth(&self) -> bool {
        self.high_bandwidth.lock().should_use(&self.env)
    }

    /// Best effective per-microframe bandwidth across the streaming
    /// interface's isochronous IN endpoints.
    pub fn max_available_bandwidth(&self, allow_high_bandwidth: bool) -> u32 {
        let Some(interface) = self
            .device
            .configuration()
            .interface(self.layout.streaming.interface_number)
        else {
            return 0;
        };

        let mut best = 0u32;
        for alternate in &interface.alternates {
            for endpoint in &alternate.endpoints {
                if !endpoint.is_iso_in() {
                    continue;
                }
                let transactions = endpoint.transactions_per_microframe();
                if transactions > 1 && !allow_high_bandwidth {
                    continue;
                }
                let effective = if transactions > 1 {
                    endpoint.total_bandwidth()
                } else {
                    endpoint.base_packet_size()
                };
                best = best.max(effective);
            }
        }
        best
    }

    /// Picks the highest-bandwidth alternate that is still usable, switches
    /// the interface to it, and reports the endpoint geometry. The pump's
    /// transfer buffer must be sized `packet_size * packets_per_transfer` so
    /// descriptor slot offsets line up.
    pub fn select_alternate(
        &self,
        negotiated: &Negotiated,
    ) -> Result<NegotiatedTransport, NegotiationError> {
        let allow_high_bandwidth = self.allow_high_bandwidth();
        let interface = self
            .device
            .configuration()
            .interface(self.layout.streaming.interface_number)
            .ok_or(NegotiationError::NoUsableAlternate)?;

        let mut best: Option<NegotiatedTransport> = None;
        for alternate in &interface.alternates {
            for endpoint in &alternate.endpoints {
                if !endpoint.is_iso_in() {
                    continue;
                }
                let base = endpoint.base_packet_size();
                let transactions = endpoint.transactions_per_microframe();
                debug!(
                    alternate = alternate.alternate,
                    base,
                    transactions,
                    "candidate endpoint"
                );
                if transactions > 1 && !allow_high_bandwidth {
                    debug!("skipping high-bandwidth endpoint");
                    continue;
                }
                let effective = if transactions > 1 {
                    base * transactions
                } else {
                    base
                };
                if best
                    .as_ref()
                    .map(|b| effective > b.packet_size)
                    .unwrap_or(true)
                {
                    best = Some(NegotiatedTransport {
                        endpoint_address: endpoint.address,
                        alternate: alternate.alternate,
                        base_packet_size: base,
                        transactions_per_microframe: transactions,
                        packet_size: effective,
                        high_bandwidth: transactions > 1,
                        max_video_frame_size: negotiated.max_video_frame_size,
                        max_payload_transfer_size: negotiated.max_payload_transfer_size,
                    });
                }
            }
        }

        let transport = best.ok_or(NegotiationError::NoUsableAlternate)?;

        if transport.packet_size < negotiated.max_payload_transfer_size.min(3072) {
            warn!(
                packet_size = transport.packet_size,
                required = negotiated.max_payload_transfer_size,
                "best alternate is below the committed payload size"
            );
        }

        // Achievable-rate advisory for the committed frame size.
        if negotiated.max_video_frame_size > 0 {
            let bytes_per_second = transport.packet_size * MICROFRAMES_PER_SECOND;
            let max_fps = bytes_per_second as f32 / negotiated.max_video_frame_size as f32;
            if max_fps < 5.0 {
                warn!(
                    max_fps,
                    "bandwidth likely insufficient at this resolution, consider stepping down"
                );
            }
        }

        self.set_interface(
            self.layout.streaming.interface_number,
            transport.alternate,
            &self.current_video_alternate,
        )?;

        if transport.high_bandwidth {
            info!(
                transactions = transport.transactions_per_microframe,
                packet_size = transport.packet_size,
                "high-bandwidth mode active"
            );
        }
        self.high_bandwidth.lock().in_use = transport.high_bandwidth;

        Ok(transport)
    }

    /// Returns the streaming interface to its zero-bandwidth alternate.
    /// Issued as a plain SET_INTERFACE on the control pipe.
    pub fn select_idle_alternate(&self) -> Result<(), NegotiationError> {
        self.set_interface(
            self.layout.streaming.interface_number,
            0,
            &self.current_video_alternate,
        )?;
        self.high_bandwidth.lock().in_use = false;
        Ok(())
    }

    /// Picks the audio streaming alternate with the widest endpoint.
    pub fn select_audio_alternate(&self) -> Result<AudioTransport, NegotiationError> {
        let audio = self
            .layout
            .audio_format
            .ok_or(NegotiationError::NoAudioInterface)?;
        let interface = self
            .device
            .configuration()
            .interface(audio.interface_number)
            .ok_or(NegotiationError::NoAudioInterface)?;

        let mut best: Option<AudioTransport> = None;
        for alternate in interface.alternates.iter().skip(1) {
            for endpoint in &alternate.endpoints {
                if !endpoint.is_iso_in() {
                    continue;
                }
                let size = endpoint.base_packet_size();
                if !(2..=1024).contains(&size) {
                    warn!(size, "audio endpoint has an unusual packet size");
                }
                if best.as_ref().map(|b| size > b.max_packet_size).unwrap_or(true) {
                    best = Some(AudioTransport {
                        endpoint_address: endpoint.address,
                        alternate: alternate.alternate,
                        max_packet_size: size,
                    });
                }
            }
        }

        let transport = best.ok_or(NegotiationError::NoAudioInterface)?;
        self.set_interface(
            audio.interface_number,
            transport.alternate,
            &self.current_audio_alternate,
        )?;
        info!(
            alternate = transport.alternate,
            max_packet = transport.max_packet_size,
            "audio alternate selected"
        );
        Ok(transport)
    }

    pub fn select_audio_idle_alternate(&self) -> Result<(), NegotiationError> {
        let Some(audio) = self.layout.audio_format else {
            return Ok(());
        };
        self.set_interface(audio.interface_number, 0, &self.current_audio_alternate)
    }

    /// Programs the endpoint sampling frequency (USB Audio 1.0, 24-bit LE).
    pub fn set_audio_sample_rate(
        &self,
        endpoint_address: u8,
        sample_rate: u32,
    ) -> Result<(), NegotiationError> {
        let data = [
            (sample_rate & 0xFF) as u8,
            ((sample_rate >> 8) & 0xFF) as u8,
            ((sample_rate >> 16) & 0xFF) as u8,
        ];
        let written = self.device.control_out(
            REQTYPE_CLASS_ENDPOINT_OUT,
            RC_SET_CUR,
            SAMPLING_FREQ_CONTROL,
            u16::from(endpoint_address),
            &data,
        )?;
        if written != data.len() {
            warn!(written, "sampling frequency request was cut short");
        } else {
            info!(sample_rate, "audio sample rate programmed");
        }
        Ok(())
    }

    fn set_interface(
        &self,
        interface: u8,
        alternate: u8,
        current: &Mutex<u8>,
    ) -> Result<(), NegotiationError> {
        let mut held = current.lock();
        if *held == alternate {
            return Ok(());
        }
        self.device.control_out(
            REQTYPE_STANDARD_INTERFACE_OUT,
            REQUEST_SET_INTERFACE,
            u16::from(alternate),
            u16::from(interface),
            &[],
        )?;
        debug!(interface, alternate, "SET_INTERFACE");
        *held = alternate;
        Ok(())
    }
}
