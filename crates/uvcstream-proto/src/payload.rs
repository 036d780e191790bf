//! UVC payload packet header parsing.

use thiserror::Error;

use crate::consts;

/// Why a packet header was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadHeaderError {
    #[error("packet too short for a header: {0} bytes")]
    PacketTooShort(usize),

    #[error("header length {0} outside 2..=12")]
    LengthOutOfRange(u8),

    #[error("header length {header_length} exceeds packet length {packet_length}")]
    LengthExceedsPacket {
        header_length: u8,
        packet_length: usize,
    },
}

/// Parsed view of one UVC payload packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub header_length: u8,
    pub flags: u8,
}

impl PayloadHeader {
    /// Validates the first bytes of a packet. The packet must carry at least
    /// the two mandatory header bytes, and the claimed header length must fit
    /// inside the packet.
    pub fn parse(packet: &[u8]) -> Result<Self, PayloadHeaderError> {
        if packet.len() < 2 {
            return Err(PayloadHeaderError::PacketTooShort(packet.len()));
        }
        let header_length = packet[0];
        if !(2..=12).contains(&header_length) {
            return Err(PayloadHeaderError::LengthOutOfRange(header_length));
        }
        if usize::from(header_length) > packet.len() {
            return Err(PayloadHeaderError::LengthExceedsPacket {
                header_length,
                packet_length: packet.len(),
            });
        }
        Ok(Self {
            header_length,
            flags: packet[1],
        })
    }

    pub fn fid(&self) -> bool {
        self.flags & consts::HEADER_FLAG_FID != 0
    }

    pub fn end_of_frame(&self) -> bool {
        self.flags & consts::HEADER_FLAG_EOF != 0
    }

    pub fn has_pts(&self) -> bool {
        self.flags & consts::HEADER_FLAG_PTS != 0
    }

    pub fn has_scr(&self) -> bool {
        self.flags & consts::HEADER_FLAG_SCR != 0
    }

    /// The per-packet error bit. A warning, not a hard failure.
    pub fn error_bit(&self) -> bool {
        self.flags & consts::HEADER_FLAG_ERR != 0
    }

    /// Header length implied by the PTS/SCR flag bits. Devices that disagree
    /// with their own flags still get their claimed length honored; the
    /// mismatch is worth a log line.
    pub fn expected_length(&self) -> u8 {
        2 + if self.has_pts() { 4 } else { 0 } + if self.has_scr() { 6 } else { 0 }
    }

    /// The payload slice of the packet this header was parsed from.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[usize::from(self.header_length)..]
    }
}
