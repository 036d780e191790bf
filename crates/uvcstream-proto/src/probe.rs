//! The UVC probe/commit control block.
//!
//! Video Class 1.0 defines a 26-byte block; 1.1 extends it to 34 bytes. All
//! fields are little-endian. The device may rewrite any field during the
//! probe phase; the commit phase must echo the device's values back.

use crate::{ProtocolError, ProtocolResult};

/// UVC specification version, from bcdUVC in the VideoControl header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvcVersion {
    V1_0,
    V1_1,
}

impl UvcVersion {
    pub fn from_bcd(bcd: u16) -> Self {
        if bcd > 0x0100 {
            UvcVersion::V1_1
        } else {
            UvcVersion::V1_0
        }
    }

    /// Size of the probe/commit block for this version.
    pub fn control_block_len(self) -> usize {
        match self {
            UvcVersion::V1_0 => 26,
            UvcVersion::V1_1 => 34,
        }
    }
}

/// Probe/commit negotiation state, mirroring the wire layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCommit {
    /// bmHint: bit 0 marks dwFrameInterval as the field to keep fixed.
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// 100 ns units.
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    // UVC 1.1 extension.
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
}

impl ProbeCommit {
    /// bmHint bit 0: dwFrameInterval is meaningful.
    pub const HINT_FRAME_INTERVAL: u16 = 0x0001;

    /// A request block asking for the given format/frame at `frame_interval`.
    pub fn request(format_index: u8, frame_index: u8, frame_interval: u32) -> Self {
        Self {
            hint: Self::HINT_FRAME_INTERVAL,
            format_index,
            frame_index,
            frame_interval,
            ..Default::default()
        }
    }

    /// Serializes for SET_CUR at the version's block length.
    pub fn to_bytes(&self, version: UvcVersion) -> Vec<u8> {
        let mut out = vec![0u8; version.control_block_len()];
        out[0..2].copy_from_slice(&self.hint.to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        if version == UvcVersion::V1_1 {
            out[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
            out[30] = self.framing_info;
            out[31] = self.preferred_version;
            out[32] = self.min_version;
            out[33] = self.max_version;
        }
        out
    }

    /// Parses a GET_CUR response.
    pub fn from_bytes(data: &[u8], version: UvcVersion) -> ProtocolResult<Self> {
        let expected = version.control_block_len();
        if data.len() < expected {
            return Err(ProtocolError::ControlBlockSize {
                expected,
                actual: data.len(),
            });
        }

        let mut block = Self {
            hint: u16::from_le_bytes([data[0], data[1]]),
            format_index: data[2],
            frame_index: data[3],
            frame_interval: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            key_frame_rate: u16::from_le_bytes([data[8], data[9]]),
            p_frame_rate: u16::from_le_bytes([data[10], data[11]]),
            comp_quality: u16::from_le_bytes([data[12], data[13]]),
            comp_window_size: u16::from_le_bytes([data[14], data[15]]),
            delay: u16::from_le_bytes([data[16], data[17]]),
            max_video_frame_size: u32::from_le_bytes([data[18], data[19], data[20], data[21]]),
            max_payload_transfer_size: u32::from_le_bytes([data[22], data[23], data[24], data[25]]),
            ..Default::default()
        };
        if version == UvcVersion::V1_1 {
            block.clock_frequency = u32::from_le_bytes([data[26], data[27], data[28], data[29]]);
            block.framing_info = data[30];
            block.preferred_version = data[31];
            block.min_version = data[32];
            block.max_version = data[33];
        }
        Ok(block)
    }
}
