//! Class-specific configuration descriptor parsing.
//!
//! The host transport hands over each interface's class-specific descriptor
//! bytes verbatim (`AlternateSetting::extra`); this module walks them and
//! builds the layout the negotiator works from: the resolution ladder with
//! format/frame indices, the processing-unit capability bits, and the PCM
//! audio format when a microphone is present.

use tracing::{debug, warn};

use uvcstream_usb::DeviceConfiguration;

use crate::consts;
use crate::format::FrameDescriptor;
use crate::{ProtocolError, ProtocolResult, UvcVersion};

/// Parsed VideoControl interface state.
#[derive(Debug, Clone)]
pub struct VideoControlInfo {
    pub interface_number: u8,
    pub version: UvcVersion,
    pub processing_unit: Option<ProcessingUnitInfo>,
}

/// The processing unit's id and bmControls capability bitmap.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingUnitInfo {
    pub unit_id: u8,
    /// Up to three bmControls bytes, LSB first.
    pub controls: u32,
}

impl ProcessingUnitInfo {
    // bmControls bit positions, per UVC 1.1 table 3-8.
    pub const BIT_BRIGHTNESS: u32 = 1 << 0;
    pub const BIT_CONTRAST: u32 = 1 << 1;
    pub const BIT_HUE: u32 = 1 << 2;
    pub const BIT_SATURATION: u32 = 1 << 3;
    pub const BIT_SHARPNESS: u32 = 1 << 4;
    pub const BIT_GAMMA: u32 = 1 << 5;
    pub const BIT_WHITE_BALANCE_TEMPERATURE: u32 = 1 << 6;
    pub const BIT_BACKLIGHT_COMPENSATION: u32 = 1 << 8;
    pub const BIT_GAIN: u32 = 1 << 9;
    pub const BIT_POWER_LINE_FREQUENCY: u32 = 1 << 10;
    pub const BIT_HUE_AUTO: u32 = 1 << 11;
    pub const BIT_WHITE_BALANCE_TEMPERATURE_AUTO: u32 = 1 << 12;

    pub fn has(&self, bit: u32) -> bool {
        self.controls & bit != 0
    }
}

/// Parsed VideoStreaming interface state: format indices plus the frame
/// lists in descriptor order. List position is the fallback ladder level
/// (level 0 first); `frame_index` inside each entry is the wire index.
#[derive(Debug, Clone, Default)]
pub struct VideoStreamingInfo {
    pub interface_number: u8,
    pub uncompressed_format_index: Option<u8>,
    pub mjpeg_format_index: Option<u8>,
    pub uncompressed_frames: Vec<FrameDescriptor>,
    pub mjpeg_frames: Vec<FrameDescriptor>,
}

impl VideoStreamingInfo {
    pub fn has_frames(&self) -> bool {
        !self.uncompressed_frames.is_empty() || !self.mjpeg_frames.is_empty()
    }
}

/// Parsed AudioControl interface state.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioControlInfo {
    pub interface_number: u8,
    pub input_terminal_id: u8,
    pub feature_unit_id: u8,
    pub channels: u8,
}

/// PCM format from the AudioStreaming FORMAT_TYPE I descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioFormatInfo {
    pub interface_number: u8,
    pub channels: u8,
    pub subframe_size: u8,
    pub bit_resolution: u8,
    /// Highest discrete rate, or the top of a continuous range.
    pub sample_rate: u32,
}

/// Everything the negotiator needs from the configuration descriptors.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    pub control: VideoControlInfo,
    pub streaming: VideoStreamingInfo,
    pub audio_control: Option<AudioControlInfo>,
    pub audio_format: Option<AudioFormatInfo>,
}

impl DeviceLayout {
    /// Walks the active configuration and parses every class-specific
    /// descriptor the core cares about.
    pub fn parse(config: &DeviceConfiguration) -> ProtocolResult<Self> {
        let mut control = None;
        let mut streaming = None;
        let mut audio_control = None;
        let mut audio_format = None;

        for interface in &config.interfaces {
            if interface.matches(consts::USB_CLASS_VIDEO, consts::USB_SUBCLASS_VIDEO_CONTROL) {
                if let Some(base) = interface.alternates.first() {
                    let mut info = parse_video_control(&base.extra)?;
                    info.interface_number = interface.number;
                    control = Some(info);
                }
            } else if interface
                .matches(consts::USB_CLASS_VIDEO, consts::USB_SUBCLASS_VIDEO_STREAMING)
            {
                let mut info = VideoStreamingInfo {
                    interface_number: interface.number,
                    ..Default::default()
                };
                // Formats normally sit on alternate 0; some devices tuck
                // them into higher alternates instead.
                for alternate in &interface.alternates {
                    parse_video_streaming(&alternate.extra, &mut info)?;
                    if info.has_frames() {
                        break;
                    }
                }
                streaming = Some(info);
            } else if interface.matches(consts::USB_CLASS_AUDIO, consts::USB_SUBCLASS_AUDIO_CONTROL)
            {
                if let Some(base) = interface.alternates.first() {
                    let mut info = parse_audio_control(&base.extra)?;
                    info.interface_number = interface.number;
                    audio_control = Some(info);
                }
            } else if interface
                .matches(consts::USB_CLASS_AUDIO, consts::USB_SUBCLASS_AUDIO_STREAMING)
            {
                // Alternate 0 is zero-bandwidth and carries no format.
                for alternate in interface.alternates.iter().skip(1) {
                    if let Some(mut info) = parse_audio_streaming(&alternate.extra)? {
                        info.interface_number = interface.number;
                        audio_format = Some(info);
                        break;
                    }
                }
            }
        }

        let control = control.ok_or(ProtocolError::NoSupportedFormat)?;
        let streaming = streaming.ok_or(ProtocolError::NoSupportedFormat)?;
        if !streaming.has_frames() {
            return Err(ProtocolError::NoSupportedFormat);
        }

        Ok(Self {
            control,
            streaming,
            audio_control,
            audio_format,
        })
    }
}

/// Iterates (subtype, body) over a class-specific descriptor stream. The body
/// includes the full descriptor, length byte first.
fn class_descriptors(extra: &[u8]) -> impl Iterator<Item = ProtocolResult<(u8, &[u8])>> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + 2 > extra.len() {
            return None;
        }
        let length = usize::from(extra[offset]);
        if length < 3 {
            // A zero or degenerate length would loop forever.
            return Some(Err(ProtocolError::ShortDescriptor {
                subtype: 0,
                length,
            }));
        }
        if offset + length > extra.len() {
            return Some(Err(ProtocolError::TruncatedDescriptor {
                claimed: length,
                available: extra.len() - offset,
            }));
        }
        let descriptor = &extra[offset..offset + length];
        offset += length;
        if descriptor[1] != consts::CS_INTERFACE {
            // Endpoint or vendor descriptors interleaved; skip.
            return Some(Ok((0xFF, descriptor)));
        }
        Some(Ok((descriptor[2], descriptor)))
    })
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parses the VideoControl interface's class-specific descriptors.
pub fn parse_video_control(extra: &[u8]) -> ProtocolResult<VideoControlInfo> {
    let mut info = VideoControlInfo {
        interface_number: 0,
        version: UvcVersion::V1_0,
        processing_unit: None,
    };

    for item in class_descriptors(extra) {
        let (subtype, descriptor) = item?;
        match subtype {
            consts::VC_HEADER => {
                if descriptor.len() < 12 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                let bcd = le16(descriptor, 3);
                info.version = UvcVersion::from_bcd(bcd);
                debug!(
                    version = format_args!("{:x}.{:02x}", bcd >> 8, bcd & 0xFF),
                    "VC_HEADER"
                );
            }
            consts::VC_PROCESSING_UNIT => {
                if descriptor.len() < 8 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                let unit_id = descriptor[3];
                let control_size = usize::from(descriptor[7]);
                let mut controls = 0u32;
                for i in 0..control_size.min(3) {
                    if let Some(&byte) = descriptor.get(8 + i) {
                        controls |= u32::from(byte) << (8 * i);
                    }
                }
                info.processing_unit = Some(ProcessingUnitInfo { unit_id, controls });
                debug!(unit_id, controls = format_args!("{controls:#x}"), "VC_PROCESSING_UNIT");
            }
            // Terminals, selector and extension units carry nothing the
            // streaming core acts on.
            consts::VC_INPUT_TERMINAL
            | consts::VC_OUTPUT_TERMINAL
            | consts::VC_SELECTOR_UNIT
            | consts::VC_EXTENSION_UNIT => {}
            _ => {}
        }
    }

    Ok(info)
}

/// Parses one alternate's VideoStreaming descriptors into `info`.
pub fn parse_video_streaming(extra: &[u8], info: &mut VideoStreamingInfo) -> ProtocolResult<()> {
    // Frame descriptors bind to the format descriptor that preceded them.
    let mut current_subtype = 0u8;

    for item in class_descriptors(extra) {
        let (subtype, descriptor) = item?;
        match subtype {
            consts::VS_FORMAT_UNCOMPRESSED => {
                if descriptor.len() < 21 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                let guid: &[u8] = &descriptor[5..21];
                if guid == &consts::GUID_YUY2[..] {
                    info.uncompressed_format_index = Some(descriptor[3]);
                    current_subtype = subtype;
                } else {
                    warn!("uncompressed format with unsupported GUID, skipping frames");
                    current_subtype = 0;
                }
            }
            consts::VS_FORMAT_MJPEG => {
                if descriptor.len() < 5 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                info.mjpeg_format_index = Some(descriptor[3]);
                current_subtype = subtype;
            }
            consts::VS_FRAME_UNCOMPRESSED | consts::VS_FRAME_MJPEG => {
                if descriptor.len() < 26 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                let frame = FrameDescriptor {
                    frame_index: descriptor[3],
                    width: u32::from(le16(descriptor, 5)),
                    height: u32::from(le16(descriptor, 7)),
                    default_frame_interval: le32(descriptor, 21),
                    intervals: {
                        let interval_type = usize::from(descriptor[25]);
                        let mut intervals = Vec::new();
                        for i in 0..interval_type {
                            let offset = 26 + i * 4;
                            if offset + 4 <= descriptor.len() {
                                intervals.push(le32(descriptor, offset));
                            }
                        }
                        intervals
                    },
                };
                debug!(
                    frame_index = frame.frame_index,
                    width = frame.width,
                    height = frame.height,
                    fps = frame.default_fps(),
                    mjpeg = subtype == consts::VS_FRAME_MJPEG,
                    "VS_FRAME"
                );
                if subtype == consts::VS_FRAME_MJPEG {
                    info.mjpeg_frames.push(frame);
                } else if current_subtype == consts::VS_FORMAT_UNCOMPRESSED {
                    info.uncompressed_frames.push(frame);
                }
            }
            consts::VS_INPUT_HEADER
            | consts::VS_COLORFORMAT
            | consts::VS_STILL_IMAGE_FRAME => {}
            _ => {}
        }
    }

    Ok(())
}

/// Parses the AudioControl interface's class-specific descriptors.
pub fn parse_audio_control(extra: &[u8]) -> ProtocolResult<AudioControlInfo> {
    let mut info = AudioControlInfo::default();

    for item in class_descriptors(extra) {
        let (subtype, descriptor) = item?;
        match subtype {
            consts::AC_INPUT_TERMINAL => {
                if descriptor.len() < 8 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                info.input_terminal_id = descriptor[3];
                info.channels = descriptor[7];
            }
            consts::AC_FEATURE_UNIT => {
                if descriptor.len() < 4 {
                    return Err(ProtocolError::ShortDescriptor {
                        subtype,
                        length: descriptor.len(),
                    });
                }
                info.feature_unit_id = descriptor[3];
            }
            consts::AC_HEADER | consts::AC_OUTPUT_TERMINAL => {}
            _ => {}
        }
    }

    Ok(info)
}

/// Parses one AudioStreaming alternate; returns the PCM format if a type I
/// FORMAT_TYPE descriptor is present.
pub fn parse_audio_streaming(extra: &[u8]) -> ProtocolResult<Option<AudioFormatInfo>> {
    for item in class_descriptors(extra) {
        let (subtype, descriptor) = item?;
        if subtype != consts::AS_FORMAT_TYPE {
            continue;
        }
        if descriptor.len() < 8 {
            return Err(ProtocolError::ShortDescriptor {
                subtype,
                length: descriptor.len(),
            });
        }
        if descriptor[3] != consts::AUDIO_FORMAT_TYPE_I {
            continue;
        }

        let mut info = AudioFormatInfo {
            interface_number: 0,
            channels: descriptor[4],
            subframe_size: descriptor[5],
            bit_resolution: descriptor[6],
            sample_rate: 0,
        };

        let freq_type = usize::from(descriptor[7]);
        let read_rate = |offset: usize| -> u32 {
            if offset + 3 > descriptor.len() {
                return 0;
            }
            u32::from(descriptor[offset])
                | u32::from(descriptor[offset + 1]) << 8
                | u32::from(descriptor[offset + 2]) << 16
        };
        if freq_type == 0 {
            // Continuous range: lower bound then upper bound.
            info.sample_rate = read_rate(11);
        } else {
            for i in 0..freq_type {
                let rate = read_rate(8 + i * 3);
                if rate > info.sample_rate {
                    info.sample_rate = rate;
                }
            }
        }
        debug!(
            channels = info.channels,
            bits = info.bit_resolution,
            rate = info.sample_rate,
            "AS_FORMAT_TYPE"
        );
        return Ok(Some(info));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcstream_usb::{
        AlternateSetting, Direction, EndpointDescriptor, InterfaceDescriptor, TransferType,
    };

    fn vc_header(bcd: u16) -> Vec<u8> {
        let mut d = vec![13, consts::CS_INTERFACE, consts::VC_HEADER];
        d.extend_from_slice(&bcd.to_le_bytes());
        d.extend_from_slice(&13u16.to_le_bytes()); // wTotalLength
        d.extend_from_slice(&48_000_000u32.to_le_bytes()); // dwClockFrequency
        d.push(1); // bInCollection
        d.push(1); // baInterfaceNr
        d
    }

    fn processing_unit(unit_id: u8, controls: [u8; 2]) -> Vec<u8> {
        let mut d = vec![10, consts::CS_INTERFACE, consts::VC_PROCESSING_UNIT];
        d.push(unit_id);
        d.push(1); // bSourceID
        d.extend_from_slice(&0u16.to_le_bytes()); // wMaxMultiplier
        d.push(2); // bControlSize
        d.extend_from_slice(&controls);
        d
    }

    fn format_uncompressed(format_index: u8) -> Vec<u8> {
        let mut d = vec![27, consts::CS_INTERFACE, consts::VS_FORMAT_UNCOMPRESSED];
        d.push(format_index);
        d.push(2); // bNumFrameDescriptors
        d.extend_from_slice(&consts::GUID_YUY2);
        d.extend_from_slice(&[16, 1, 0, 0, 0, 0]); // bpp, default frame, aspect, flags
        d
    }

    fn format_mjpeg(format_index: u8) -> Vec<u8> {
        vec![
            11,
            consts::CS_INTERFACE,
            consts::VS_FORMAT_MJPEG,
            format_index,
            2, // bNumFrameDescriptors
            1, // bmFlags
            1,
            0,
            0,
            0,
            0,
        ]
    }

    fn frame(subtype: u8, frame_index: u8, width: u16, height: u16, interval: u32) -> Vec<u8> {
        let mut d = vec![30, consts::CS_INTERFACE, subtype];
        d.push(frame_index);
        d.push(0); // bmCapabilities
        d.extend_from_slice(&width.to_le_bytes());
        d.extend_from_slice(&height.to_le_bytes());
        d.extend_from_slice(&0u32.to_le_bytes()); // dwMinBitRate
        d.extend_from_slice(&0u32.to_le_bytes()); // dwMaxBitRate
        d.extend_from_slice(&0u32.to_le_bytes()); // dwMaxVideoFrameBufferSize
        d.extend_from_slice(&interval.to_le_bytes());
        d.push(1); // bFrameIntervalType: one discrete interval
        d.extend_from_slice(&interval.to_le_bytes());
        d
    }

    fn audio_format_type_i(channels: u8, bits: u8, rates: &[u32]) -> Vec<u8> {
        let mut d = vec![
            (8 + rates.len() * 3) as u8,
            consts::CS_INTERFACE,
            consts::AS_FORMAT_TYPE,
            consts::AUDIO_FORMAT_TYPE_I,
            channels,
            bits / 8,
            bits,
            rates.len() as u8,
        ];
        for rate in rates {
            d.push((rate & 0xFF) as u8);
            d.push(((rate >> 8) & 0xFF) as u8);
            d.push(((rate >> 16) & 0xFF) as u8);
        }
        d
    }

    fn streaming_extra() -> Vec<u8> {
        let mut extra = Vec::new();
        extra.extend(format_mjpeg(2));
        extra.extend(frame(consts::VS_FRAME_MJPEG, 1, 1280, 720, 333_333));
        extra.extend(frame(consts::VS_FRAME_MJPEG, 2, 320, 240, 333_333));
        extra.extend(format_uncompressed(1));
        extra.extend(frame(consts::VS_FRAME_UNCOMPRESSED, 1, 1280, 720, 1_000_000));
        extra.extend(frame(consts::VS_FRAME_UNCOMPRESSED, 2, 320, 240, 333_333));
        extra
    }

    fn interface(number: u8, class_code: u8, subclass: u8, extra: Vec<u8>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            number,
            class_code,
            subclass,
            alternates: vec![AlternateSetting {
                alternate: 0,
                endpoints: vec![],
                extra,
            }],
        }
    }

    #[test]
    fn full_layout_parses() {
        let mut control_extra = vc_header(0x0110);
        control_extra.extend(processing_unit(3, [0x3F, 0x03]));

        let config = DeviceConfiguration {
            interfaces: vec![
                interface(
                    0,
                    consts::USB_CLASS_VIDEO,
                    consts::USB_SUBCLASS_VIDEO_CONTROL,
                    control_extra,
                ),
                interface(
                    1,
                    consts::USB_CLASS_VIDEO,
                    consts::USB_SUBCLASS_VIDEO_STREAMING,
                    streaming_extra(),
                ),
            ],
        };

        let layout = DeviceLayout::parse(&config).unwrap();
        assert_eq!(layout.control.version, UvcVersion::V1_1);
        let pu = layout.control.processing_unit.unwrap();
        assert_eq!(pu.unit_id, 3);
        assert!(pu.has(ProcessingUnitInfo::BIT_BRIGHTNESS));
        assert!(pu.has(ProcessingUnitInfo::BIT_GAIN));
        assert!(!pu.has(ProcessingUnitInfo::BIT_WHITE_BALANCE_TEMPERATURE));

        assert_eq!(layout.streaming.mjpeg_format_index, Some(2));
        assert_eq!(layout.streaming.uncompressed_format_index, Some(1));
        assert_eq!(layout.streaming.mjpeg_frames.len(), 2);
        assert_eq!(layout.streaming.uncompressed_frames.len(), 2);
        assert_eq!(layout.streaming.mjpeg_frames[0].width, 1280);
        assert_eq!(layout.streaming.mjpeg_frames[1].frame_index, 2);
        assert!(layout.audio_format.is_none());
    }

    #[test]
    fn audio_format_picks_highest_rate() {
        let info = parse_audio_streaming(&audio_format_type_i(2, 16, &[44_100, 48_000, 16_000]))
            .unwrap()
            .unwrap();
        assert_eq!(info.channels, 2);
        assert_eq!(info.bit_resolution, 16);
        assert_eq!(info.subframe_size, 2);
        assert_eq!(info.sample_rate, 48_000);
    }

    #[test]
    fn audio_control_records_units() {
        let mut extra = vec![
            12,
            consts::CS_INTERFACE,
            consts::AC_INPUT_TERMINAL,
            4,    // bTerminalID
            0x01, // wTerminalType low (microphone 0x0201)
            0x02,
            0, // bAssocTerminal
            1, // bNrChannels
            0,
            0,
            0,
            0,
        ];
        extra.extend([6, consts::CS_INTERFACE, consts::AC_FEATURE_UNIT, 5, 4, 0]);
        let info = parse_audio_control(&extra).unwrap();
        assert_eq!(info.input_terminal_id, 4);
        assert_eq!(info.feature_unit_id, 5);
        assert_eq!(info.channels, 1);
    }

    #[test]
    fn truncated_descriptor_is_an_error() {
        // Claims 30 bytes, provides 10.
        let extra = vec![30, consts::CS_INTERFACE, consts::VS_FRAME_MJPEG, 0, 0, 0, 0, 0, 0, 0];
        let mut info = VideoStreamingInfo::default();
        let err = parse_video_streaming(&extra, &mut info).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedDescriptor { .. }));
    }

    #[test]
    fn unknown_guid_frames_are_ignored() {
        let mut d = vec![27, consts::CS_INTERFACE, consts::VS_FORMAT_UNCOMPRESSED, 1, 1];
        d.extend_from_slice(&consts::GUID_NV12);
        d.extend_from_slice(&[12, 1, 0, 0, 0, 0]);
        d.extend(frame(consts::VS_FRAME_UNCOMPRESSED, 1, 640, 480, 333_333));

        let mut info = VideoStreamingInfo::default();
        parse_video_streaming(&d, &mut info).unwrap();
        assert!(info.uncompressed_frames.is_empty());
        assert!(info.uncompressed_format_index.is_none());
    }

    #[test]
    fn layout_without_frames_is_rejected() {
        let config = DeviceConfiguration {
            interfaces: vec![
                interface(
                    0,
                    consts::USB_CLASS_VIDEO,
                    consts::USB_SUBCLASS_VIDEO_CONTROL,
                    vc_header(0x0100),
                ),
                interface(
                    1,
                    consts::USB_CLASS_VIDEO,
                    consts::USB_SUBCLASS_VIDEO_STREAMING,
                    Vec::new(),
                ),
            ],
        };
        assert!(matches!(
            DeviceLayout::parse(&config),
            Err(ProtocolError::NoSupportedFormat)
        ));
    }

    #[test]
    fn streaming_formats_found_in_higher_alternate() {
        let mut streaming = interface(
            1,
            consts::USB_CLASS_VIDEO,
            consts::USB_SUBCLASS_VIDEO_STREAMING,
            Vec::new(),
        );
        streaming.alternates.push(AlternateSetting {
            alternate: 1,
            endpoints: vec![EndpointDescriptor {
                address: 0x81,
                transfer_type: TransferType::Isochronous,
                direction: Direction::In,
                max_packet_size: 1023,
            }],
            extra: streaming_extra(),
        });

        let config = DeviceConfiguration {
            interfaces: vec![
                interface(
                    0,
                    consts::USB_CLASS_VIDEO,
                    consts::USB_SUBCLASS_VIDEO_CONTROL,
                    vc_header(0x0100),
                ),
                streaming,
            ],
        };
        let layout = DeviceLayout::parse(&config).unwrap();
        assert!(layout.streaming.has_frames());
    }
}
