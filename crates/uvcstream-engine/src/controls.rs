//! Image-quality and audio control surface.
//!
//! Wraps the UVC processing unit's GET/SET requests and the USB-Audio
//! feature unit's mute/volume. Ranges are probed once at session start with
//! GET_MIN/GET_MAX/GET_DEF/GET_RES; writes are serialized by a single mutex
//! so a control tweak never interleaves with another on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use uvcstream_proto::consts::{
    FU_MUTE, FU_VOLUME, PU_BACKLIGHT_COMPENSATION, PU_BRIGHTNESS, PU_CONTRAST, PU_GAIN,
    PU_GAMMA, PU_HUE, PU_POWER_LINE_FREQUENCY, PU_SATURATION, PU_SHARPNESS,
    PU_WHITE_BALANCE_TEMPERATURE, RC_GET_CUR, RC_GET_DEF, RC_GET_MAX, RC_GET_MIN, RC_GET_RES,
    RC_SET_CUR, REQTYPE_CLASS_INTERFACE_IN, REQTYPE_CLASS_INTERFACE_OUT,
};
use uvcstream_proto::{AudioControlInfo, ProcessingUnitInfo};
use uvcstream_usb::{TransportError, UsbDevice};

/// Errors from control reads and writes; these surface to the caller.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control {0:?} not supported by this device")]
    Unsupported(ControlId),

    #[error("value {value} outside [{min}, {max}]")]
    OutOfRange { value: i32, min: i32, max: i32 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for control operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// The controls the surface can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    Brightness,
    Contrast,
    Hue,
    Saturation,
    Sharpness,
    Gamma,
    WhiteBalanceTemperature,
    Gain,
    BacklightCompensation,
    PowerLineFrequency,
    /// Ladder index selector, handled by the session rather than the wire.
    ResolutionIndex,
    Mute,
    Volume,
}

impl ControlId {
    /// All wire-backed video controls, in probe order.
    const VIDEO_CONTROLS: [ControlId; 10] = [
        ControlId::Brightness,
        ControlId::Contrast,
        ControlId::Hue,
        ControlId::Saturation,
        ControlId::Sharpness,
        ControlId::Gamma,
        ControlId::WhiteBalanceTemperature,
        ControlId::Gain,
        ControlId::BacklightCompensation,
        ControlId::PowerLineFrequency,
    ];

    fn pu_selector(self) -> Option<u8> {
        match self {
            ControlId::Brightness => Some(PU_BRIGHTNESS),
            ControlId::Contrast => Some(PU_CONTRAST),
            ControlId::Hue => Some(PU_HUE),
            ControlId::Saturation => Some(PU_SATURATION),
            ControlId::Sharpness => Some(PU_SHARPNESS),
            ControlId::Gamma => Some(PU_GAMMA),
            ControlId::WhiteBalanceTemperature => Some(PU_WHITE_BALANCE_TEMPERATURE),
            ControlId::Gain => Some(PU_GAIN),
            ControlId::BacklightCompensation => Some(PU_BACKLIGHT_COMPENSATION),
            ControlId::PowerLineFrequency => Some(PU_POWER_LINE_FREQUENCY),
            _ => None,
        }
    }

    fn capability_bit(self) -> Option<u32> {
        match self {
            ControlId::Brightness => Some(ProcessingUnitInfo::BIT_BRIGHTNESS),
            ControlId::Contrast => Some(ProcessingUnitInfo::BIT_CONTRAST),
            ControlId::Hue => Some(ProcessingUnitInfo::BIT_HUE),
            ControlId::Saturation => Some(ProcessingUnitInfo::BIT_SATURATION),
            ControlId::Sharpness => Some(ProcessingUnitInfo::BIT_SHARPNESS),
            ControlId::Gamma => Some(ProcessingUnitInfo::BIT_GAMMA),
            ControlId::WhiteBalanceTemperature => {
                Some(ProcessingUnitInfo::BIT_WHITE_BALANCE_TEMPERATURE)
            }
            ControlId::Gain => Some(ProcessingUnitInfo::BIT_GAIN),
            ControlId::BacklightCompensation => {
                Some(ProcessingUnitInfo::BIT_BACKLIGHT_COMPENSATION)
            }
            ControlId::PowerLineFrequency => Some(ProcessingUnitInfo::BIT_POWER_LINE_FREQUENCY),
            _ => None,
        }
    }

    /// Wire width of the control's value.
    fn value_len(self) -> usize {
        match self {
            ControlId::PowerLineFrequency | ControlId::Mute => 1,
            _ => 2,
        }
    }

    fn has_auto_companion(self) -> bool {
        matches!(
            self,
            ControlId::Hue | ControlId::WhiteBalanceTemperature
        )
    }
}

/// Probed range and current value for one control.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRange {
    pub current: i32,
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub default: i32,
    pub has_auto: bool,
}

/// Read-mostly control table over the device's processing and feature units.
pub struct ControlSurface {
    device: Arc<dyn UsbDevice>,
    processing_unit: Option<ProcessingUnitInfo>,
    control_interface: u8,
    audio: Option<AudioControlInfo>,
    ranges: Mutex<HashMap<ControlId, ControlRange>>,
    /// Serializes SET_CUR traffic.
    write_lock: Mutex<()>,
    resolution_index: Mutex<usize>,
}

impl ControlSurface {
    pub fn new(
        device: Arc<dyn UsbDevice>,
        processing_unit: Option<ProcessingUnitInfo>,
        control_interface: u8,
        audio: Option<AudioControlInfo>,
    ) -> Self {
        Self {
            device,
            processing_unit,
            control_interface,
            audio,
            ranges: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            resolution_index: Mutex::new(0),
        }
    }

    /// Probes min/max/default/step for every control the processing unit
    /// advertises. Individual probe failures leave that control out.
    pub fn populate(&self) {
        let Some(pu) = self.processing_unit else {
            return;
        };
        let mut ranges = self.ranges.lock();
        for id in ControlId::VIDEO_CONTROLS {
            let Some(bit) = id.capability_bit() else {
                continue;
            };
            if !pu.has(bit) {
                continue;
            }
            match self.probe_range(id) {
                Ok(mut range) => {
                    if id.has_auto_companion() {
                        range.has_auto = pu.has(match id {
                            ControlId::Hue => ProcessingUnitInfo::BIT_HUE_AUTO,
                            _ => ProcessingUnitInfo::BIT_WHITE_BALANCE_TEMPERATURE_AUTO,
                        });
                    }
                    debug!(?id, ?range, "control probed");
                    ranges.insert(id, range);
                }
                Err(err) => warn!(?id, "control range probe failed: {err}"),
            }
        }
        if self.audio.is_some() {
            ranges.insert(ControlId::Mute, ControlRange {
                min: 0,
                max: 1,
                step: 1,
                ..Default::default()
            });
            if let Ok(range) = self.probe_audio_range(ControlId::Volume) {
                ranges.insert(ControlId::Volume, range);
            }
        }
    }

    /// The probed range, when the device supports this control.
    pub fn range(&self, id: ControlId) -> Option<ControlRange> {
        self.ranges.lock().get(&id).copied()
    }

    pub fn supported(&self) -> Vec<ControlId> {
        self.ranges.lock().keys().copied().collect()
    }

    /// Reads the current value from the device.
    pub fn get(&self, id: ControlId) -> ControlResult<i32> {
        match id {
            ControlId::ResolutionIndex => Ok(*self.resolution_index.lock() as i32),
            ControlId::Mute | ControlId::Volume => self.audio_request(id, RC_GET_CUR, None),
            _ => {
                let value = self.video_request(id, RC_GET_CUR, None)?;
                if let Some(range) = self.ranges.lock().get_mut(&id) {
                    range.current = value;
                }
                Ok(value)
            }
        }
    }

    /// Writes a value, range-checked against the probed limits.
    pub fn set(&self, id: ControlId, value: i32) -> ControlResult<()> {
        if let Some(range) = self.range(id) {
            if range.max > range.min && (value < range.min || value > range.max) {
                return Err(ControlError::OutOfRange {
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        match id {
            ControlId::ResolutionIndex => {
                *self.resolution_index.lock() = value.max(0) as usize;
                Ok(())
            }
            ControlId::Mute | ControlId::Volume => {
                self.audio_request(id, RC_SET_CUR, Some(value))?;
                Ok(())
            }
            _ => {
                self.video_request(id, RC_SET_CUR, Some(value))?;
                if let Some(range) = self.ranges.lock().get_mut(&id) {
                    range.current = value;
                }
                Ok(())
            }
        }
    }

    /// The ladder index the consumer selected; the session reads this when
    /// (re)starting the stream.
    pub fn selected_resolution_index(&self) -> usize {
        *self.resolution_index.lock()
    }

    fn probe_range(&self, id: ControlId) -> ControlResult<ControlRange> {
        Ok(ControlRange {
            min: self.video_request(id, RC_GET_MIN, None)?,
            max: self.video_request(id, RC_GET_MAX, None)?,
            default: self.video_request(id, RC_GET_DEF, None)?,
            step: self.video_request(id, RC_GET_RES, None).unwrap_or(1),
            current: self.video_request(id, RC_GET_CUR, None).unwrap_or(0),
            has_auto: false,
        })
    }

    fn probe_audio_range(&self, id: ControlId) -> ControlResult<ControlRange> {
        Ok(ControlRange {
            min: self.audio_request(id, RC_GET_MIN, None)?,
            max: self.audio_request(id, RC_GET_MAX, None)?,
            default: self.audio_request(id, RC_GET_CUR, None).unwrap_or(0),
            step: self.audio_request(id, RC_GET_RES, None).unwrap_or(1),
            current: self.audio_request(id, RC_GET_CUR, None).unwrap_or(0),
            has_auto: false,
        })
    }

    /// One processing-unit control transfer. wValue carries the selector,
    /// wIndex the unit id and interface.
    fn video_request(
        &self,
        id: ControlId,
        request: u8,
        set_value: Option<i32>,
    ) -> ControlResult<i32> {
        let pu = self.processing_unit.ok_or(ControlError::Unsupported(id))?;
        let selector = id.pu_selector().ok_or(ControlError::Unsupported(id))?;
        let value = u16::from(selector) << 8;
        let index = (u16::from(pu.unit_id) << 8) | u16::from(self.control_interface);
        self.transfer(id, request, value, index, set_value)
    }

    /// One feature-unit control transfer for the microphone path.
    fn audio_request(
        &self,
        id: ControlId,
        request: u8,
        set_value: Option<i32>,
    ) -> ControlResult<i32> {
        let audio = self.audio.ok_or(ControlError::Unsupported(id))?;
        if audio.feature_unit_id == 0 {
            return Err(ControlError::Unsupported(id));
        }
        let selector = match id {
            ControlId::Mute => FU_MUTE,
            ControlId::Volume => FU_VOLUME,
            _ => return Err(ControlError::Unsupported(id)),
        };
        // Master channel (0) in the low byte.
        let value = u16::from(selector) << 8;
        let index =
            (u16::from(audio.feature_unit_id) << 8) | u16::from(audio.interface_number);
        self.transfer(id, request, value, index, set_value)
    }

    fn transfer(
        &self,
        id: ControlId,
        request: u8,
        value: u16,
        index: u16,
        set_value: Option<i32>,
    ) -> ControlResult<i32> {
        let len = id.value_len();
        match set_value {
            Some(v) => {
                let _serialized = self.write_lock.lock();
                let bytes = (v as i16).to_le_bytes();
                self.device.control_out(
                    REQTYPE_CLASS_INTERFACE_OUT,
                    request,
                    value,
                    index,
                    &bytes[..len],
                )?;
                Ok(v)
            }
            None => {
                let mut bytes = [0u8; 2];
                self.device.control_in(
                    REQTYPE_CLASS_INTERFACE_IN,
                    request,
                    value,
                    index,
                    &mut bytes[..len],
                )?;
                let raw = if len == 1 {
                    i32::from(bytes[0] as i8)
                } else {
                    i32::from(i16::from_le_bytes(bytes))
                };
                Ok(raw)
            }
        }
    }
}
