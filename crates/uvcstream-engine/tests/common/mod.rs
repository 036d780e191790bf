//! Scripted USB device for session tests: a two-resolution YUY2 camera with
//! a microphone, a plain isochronous alternate and a high-bandwidth one.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use uvcstream_proto::consts;
use uvcstream_proto::{ProbeCommit, UvcVersion};
use uvcstream_usb::{
    AlternateSetting, DeviceConfiguration, Direction, EndpointDescriptor, ErrorKind,
    InterfaceDescriptor, IsoPacket, PacketStatus, TransferType, TransportError, TransportResult,
    UsbBulkEndpoint, UsbDevice, UsbIsoEndpoint,
};

pub const VC_INTERFACE: u8 = 0;
pub const VS_INTERFACE: u8 = 1;
pub const AC_INTERFACE: u8 = 2;
pub const AS_INTERFACE: u8 = 3;

pub const PLAIN_EP: u8 = 0x81;
pub const HIGH_BANDWIDTH_EP: u8 = 0x82;
pub const AUDIO_EP: u8 = 0x83;

/// Ladder the mock advertises: frame index 1 is 32x24, index 2 is 16x12.
pub fn dims_for_frame_index(frame_index: u8) -> (u32, u32) {
    match frame_index {
        1 => (32, 24),
        _ => (16, 12),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    /// Percentage of video packets flagged as failed.
    pub loss_percent: u8,
    /// The high-bandwidth endpoint returns only failed packets.
    pub high_bandwidth_broken: bool,
}

#[derive(Default)]
pub struct MockState {
    pub last_probe: Option<ProbeCommit>,
    pub committed: Option<ProbeCommit>,
    /// (interface, alternate) in issue order.
    pub set_interfaces: Vec<(u16, u16)>,
    pub sample_rates: Vec<u32>,
    pub control_writes: HashMap<(u16, u16), i32>,
}

pub struct MockDevice {
    config: DeviceConfiguration,
    pub behavior: Mutex<MockBehavior>,
    pub state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            config: build_configuration(),
            behavior: Mutex::new(behavior),
            state: Mutex::new(MockState::default()),
        })
    }

    fn committed_frame_size(&self) -> usize {
        let frame_index = self
            .state
            .lock()
            .committed
            .map(|c| c.frame_index)
            .unwrap_or(1);
        let (w, h) = dims_for_frame_index(frame_index);
        (w * h * 2) as usize
    }
}

impl UsbDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        0x1BCF
    }

    fn product_id(&self) -> u16 {
        0x0001
    }

    fn configuration(&self) -> &DeviceConfiguration {
        &self.config
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> TransportResult<usize> {
        match (request_type, request) {
            (consts::REQTYPE_CLASS_INTERFACE_OUT, consts::RC_SET_CUR)
                if value == consts::VS_PROBE_CONTROL && index == u16::from(VS_INTERFACE) =>
            {
                let block = ProbeCommit::from_bytes(data, UvcVersion::V1_0)
                    .map_err(|e| TransportError::Unknown(e.to_string()))?;
                self.state.lock().last_probe = Some(block);
                Ok(data.len())
            }
            (consts::REQTYPE_CLASS_INTERFACE_OUT, consts::RC_SET_CUR)
                if value == consts::VS_COMMIT_CONTROL && index == u16::from(VS_INTERFACE) =>
            {
                let block = ProbeCommit::from_bytes(data, UvcVersion::V1_0)
                    .map_err(|e| TransportError::Unknown(e.to_string()))?;
                self.state.lock().committed = Some(block);
                Ok(data.len())
            }
            (consts::REQTYPE_STANDARD_INTERFACE_OUT, consts::REQUEST_SET_INTERFACE) => {
                self.state.lock().set_interfaces.push((index, value));
                Ok(0)
            }
            (consts::REQTYPE_CLASS_ENDPOINT_OUT, consts::RC_SET_CUR) => {
                let rate = u32::from(data[0])
                    | u32::from(data[1]) << 8
                    | u32::from(data[2]) << 16;
                self.state.lock().sample_rates.push(rate);
                Ok(data.len())
            }
            (consts::REQTYPE_CLASS_INTERFACE_OUT, consts::RC_SET_CUR) => {
                let raw = if data.len() == 1 {
                    i32::from(data[0] as i8)
                } else {
                    i32::from(i16::from_le_bytes([data[0], data[1]]))
                };
                self.state.lock().control_writes.insert((value, index), raw);
                Ok(data.len())
            }
            _ => Err(TransportError::Unknown(format!(
                "unexpected control OUT {request_type:#04x}/{request:#04x}"
            ))),
        }
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> TransportResult<usize> {
        if request_type != consts::REQTYPE_CLASS_INTERFACE_IN {
            return Err(TransportError::Unknown("unexpected control IN".into()));
        }
        // Probe GET_CUR: echo the request with the device's accepted sizes.
        if request == consts::RC_GET_CUR
            && value == consts::VS_PROBE_CONTROL
            && index == u16::from(VS_INTERFACE)
        {
            let mut block = self
                .state
                .lock()
                .last_probe
                .ok_or_else(|| TransportError::Unknown("probe before SET_CUR".into()))?;
            let (w, h) = dims_for_frame_index(block.frame_index);
            block.max_video_frame_size = w * h * 2;
            block.max_payload_transfer_size = 3072;
            let bytes = block.to_bytes(UvcVersion::V1_0);
            data[..bytes.len()].copy_from_slice(&bytes);
            return Ok(bytes.len());
        }

        // Processing-unit / feature-unit range probes and reads.
        let reply: i16 = match request {
            consts::RC_GET_MIN => -10,
            consts::RC_GET_MAX => 100,
            consts::RC_GET_DEF => 5,
            consts::RC_GET_RES => 1,
            consts::RC_GET_CUR => {
                let stored = self.state.lock().control_writes.get(&(value, index)).copied();
                stored.unwrap_or(5) as i16
            }
            _ => 0,
        };
        if data.len() == 1 {
            data[0] = reply as u8;
        } else {
            data[..2].copy_from_slice(&reply.to_le_bytes());
        }
        Ok(data.len())
    }

    fn open_iso_in(&self, address: u8) -> TransportResult<Box<dyn UsbIsoEndpoint>> {
        let behavior = *self.behavior.lock();
        match address {
            PLAIN_EP => Ok(Box::new(CameraEndpoint {
                frame_size: self.committed_frame_size(),
                fid: false,
                offset: 0,
                loss_percent: behavior.loss_percent,
                all_error: false,
                packet_counter: 0,
            })),
            HIGH_BANDWIDTH_EP => Ok(Box::new(CameraEndpoint {
                frame_size: self.committed_frame_size(),
                fid: false,
                offset: 0,
                loss_percent: behavior.loss_percent,
                all_error: behavior.high_bandwidth_broken,
                packet_counter: 0,
            })),
            AUDIO_EP => Ok(Box::new(MicEndpoint { next_value: 0 })),
            _ => Err(TransportError::Unknown(format!(
                "no endpoint {address:#04x}"
            ))),
        }
    }

    fn open_bulk_in(&self, _address: u8) -> TransportResult<Box<dyn UsbBulkEndpoint>> {
        Err(TransportError::Unknown("no bulk endpoints".into()))
    }

    fn clear_halt(&self, _address: u8) -> TransportResult<()> {
        Ok(())
    }
}

/// Generates an endless UVC payload stream for the committed frame size.
struct CameraEndpoint {
    frame_size: usize,
    fid: bool,
    offset: usize,
    loss_percent: u8,
    all_error: bool,
    packet_counter: u64,
}

impl UsbIsoEndpoint for CameraEndpoint {
    fn submit(&mut self, buffer: &mut [u8], packets: &mut [IsoPacket]) -> TransportResult<usize> {
        // Keep the pump from spinning faster than a real bus.
        thread::sleep(Duration::from_millis(1));

        if self.all_error {
            for packet in packets.iter_mut() {
                packet.actual_length = 0;
                packet.status = PacketStatus::Failed(ErrorKind::Crc);
            }
            return Ok(0);
        }

        let slot = packets[0].request_length as usize;
        let mut total = 0usize;
        for (i, packet) in packets.iter_mut().enumerate() {
            self.packet_counter += 1;
            if self.loss_percent > 0 && (self.packet_counter % 100) < u64::from(self.loss_percent)
            {
                packet.actual_length = 0;
                packet.status = PacketStatus::Failed(ErrorKind::Crc);
                continue;
            }

            let remaining = self.frame_size - self.offset;
            let chunk = remaining.min(slot - 2);
            let eof = chunk == remaining;
            let mut flags = if self.fid { consts::HEADER_FLAG_FID } else { 0 };
            if eof {
                flags |= consts::HEADER_FLAG_EOF;
            }

            let start = i * slot;
            buffer[start] = 2;
            buffer[start + 1] = flags;
            for byte in &mut buffer[start + 2..start + 2 + chunk] {
                *byte = 0x80;
            }
            packet.actual_length = (2 + chunk) as u32;
            packet.status = PacketStatus::Ok;
            total += 2 + chunk;

            self.offset += chunk;
            if eof {
                self.offset = 0;
                self.fid = !self.fid;
            }
        }
        Ok(total)
    }
}

/// Produces a deterministic PCM byte ramp.
struct MicEndpoint {
    next_value: u8,
}

impl UsbIsoEndpoint for MicEndpoint {
    fn submit(&mut self, buffer: &mut [u8], packets: &mut [IsoPacket]) -> TransportResult<usize> {
        thread::sleep(Duration::from_millis(1));
        let slot = packets[0].request_length as usize;
        let mut total = 0usize;
        for (i, packet) in packets.iter_mut().enumerate() {
            let start = i * slot;
            for byte in &mut buffer[start..start + slot] {
                *byte = self.next_value;
                self.next_value = self.next_value.wrapping_add(1);
            }
            packet.actual_length = slot as u32;
            packet.status = PacketStatus::Ok;
            total += slot;
        }
        Ok(total)
    }
}

fn build_configuration() -> DeviceConfiguration {
    DeviceConfiguration {
        interfaces: vec![
            InterfaceDescriptor {
                number: VC_INTERFACE,
                class_code: consts::USB_CLASS_VIDEO,
                subclass: consts::USB_SUBCLASS_VIDEO_CONTROL,
                alternates: vec![AlternateSetting {
                    alternate: 0,
                    endpoints: vec![],
                    extra: video_control_extra(),
                }],
            },
            InterfaceDescriptor {
                number: VS_INTERFACE,
                class_code: consts::USB_CLASS_VIDEO,
                subclass: consts::USB_SUBCLASS_VIDEO_STREAMING,
                alternates: vec![
                    AlternateSetting {
                        alternate: 0,
                        endpoints: vec![],
                        extra: video_streaming_extra(),
                    },
                    AlternateSetting {
                        alternate: 1,
                        endpoints: vec![iso_in(PLAIN_EP, 1023)],
                        extra: Vec::new(),
                    },
                    AlternateSetting {
                        alternate: 2,
                        // 1024 bytes x 3 transactions per microframe.
                        endpoints: vec![iso_in(HIGH_BANDWIDTH_EP, 0x1400)],
                        extra: Vec::new(),
                    },
                ],
            },
            InterfaceDescriptor {
                number: AC_INTERFACE,
                class_code: consts::USB_CLASS_AUDIO,
                subclass: consts::USB_SUBCLASS_AUDIO_CONTROL,
                alternates: vec![AlternateSetting {
                    alternate: 0,
                    endpoints: vec![],
                    extra: audio_control_extra(),
                }],
            },
            InterfaceDescriptor {
                number: AS_INTERFACE,
                class_code: consts::USB_CLASS_AUDIO,
                subclass: consts::USB_SUBCLASS_AUDIO_STREAMING,
                alternates: vec![
                    AlternateSetting {
                        alternate: 0,
                        endpoints: vec![],
                        extra: Vec::new(),
                    },
                    AlternateSetting {
                        alternate: 1,
                        endpoints: vec![iso_in(AUDIO_EP, 64)],
                        extra: audio_streaming_extra(),
                    },
                ],
            },
        ],
    }
}

fn iso_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        transfer_type: TransferType::Isochronous,
        direction: Direction::In,
        max_packet_size,
    }
}

fn video_control_extra() -> Vec<u8> {
    let mut extra = vec![13, consts::CS_INTERFACE, consts::VC_HEADER];
    extra.extend_from_slice(&0x0100u16.to_le_bytes()); // bcdUVC 1.0
    extra.extend_from_slice(&13u16.to_le_bytes());
    extra.extend_from_slice(&48_000_000u32.to_le_bytes());
    extra.push(1);
    extra.push(VS_INTERFACE);

    // Processing unit 3: brightness, contrast, saturation, gain.
    extra.extend_from_slice(&[10, consts::CS_INTERFACE, consts::VC_PROCESSING_UNIT]);
    extra.push(3); // bUnitID
    extra.push(1); // bSourceID
    extra.extend_from_slice(&0u16.to_le_bytes());
    extra.push(2); // bControlSize
    extra.push(0b0000_1011); // brightness, contrast, saturation
    extra.push(0b0000_0010); // gain
    extra
}

fn frame_descriptor(frame_index: u8, width: u16, height: u16) -> Vec<u8> {
    let interval = 333_333u32;
    let mut d = vec![30, consts::CS_INTERFACE, consts::VS_FRAME_UNCOMPRESSED];
    d.push(frame_index);
    d.push(0);
    d.extend_from_slice(&width.to_le_bytes());
    d.extend_from_slice(&height.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&u32::from(width) .to_le_bytes());
    d.extend_from_slice(&interval.to_le_bytes());
    d.push(1);
    d.extend_from_slice(&interval.to_le_bytes());
    d
}

fn video_streaming_extra() -> Vec<u8> {
    let mut extra = vec![27, consts::CS_INTERFACE, consts::VS_FORMAT_UNCOMPRESSED];
    extra.push(1); // bFormatIndex
    extra.push(2); // bNumFrameDescriptors
    extra.extend_from_slice(&consts::GUID_YUY2);
    extra.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
    extra.extend(frame_descriptor(1, 32, 24));
    extra.extend(frame_descriptor(2, 16, 12));
    extra
}

fn audio_control_extra() -> Vec<u8> {
    let mut extra = vec![
        12,
        consts::CS_INTERFACE,
        consts::AC_INPUT_TERMINAL,
        4,    // bTerminalID
        0x01, // wTerminalType: microphone (0x0201)
        0x02,
        0,
        1, // bNrChannels
        0,
        0,
        0,
        0,
    ];
    extra.extend([6, consts::CS_INTERFACE, consts::AC_FEATURE_UNIT, 5, 4, 0]);
    extra
}

fn audio_streaming_extra() -> Vec<u8> {
    vec![
        11,
        consts::CS_INTERFACE,
        consts::AS_FORMAT_TYPE,
        consts::AUDIO_FORMAT_TYPE_I,
        1,  // channels
        2,  // subframe size
        16, // bits
        1,  // one discrete rate
        0x40,
        0x1F,
        0x00, // 8000 Hz
    ]
}
