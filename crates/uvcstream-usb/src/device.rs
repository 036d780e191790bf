//! Traits and descriptor model for the host USB transport.
//!
//! The streaming core never talks to the host USB stack directly; it drives
//! these traits. A production implementation wraps the OS primitives, the
//! test suite scripts them.

use crate::{ErrorKind, TransportResult};

/// Transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Direction of an endpoint, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One endpoint within an alternate setting.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included.
    pub address: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    /// Raw wMaxPacketSize field, including the high-bandwidth bits.
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// Base packet size: bits 10..0 of wMaxPacketSize.
    pub fn base_packet_size(&self) -> u32 {
        u32::from(self.max_packet_size) & 0x7FF
    }

    /// Transactions per microframe (1..=3): bits 12..11 of wMaxPacketSize
    /// encode the additional transaction opportunities.
    pub fn transactions_per_microframe(&self) -> u32 {
        ((u32::from(self.max_packet_size) >> 11) & 0x3) + 1
    }

    /// Total bytes per microframe when high-bandwidth is in use.
    pub fn total_bandwidth(&self) -> u32 {
        self.base_packet_size() * self.transactions_per_microframe()
    }

    pub fn is_iso_in(&self) -> bool {
        self.transfer_type == TransferType::Isochronous && self.direction == Direction::In
    }

    pub fn is_bulk_in(&self) -> bool {
        self.transfer_type == TransferType::Bulk && self.direction == Direction::In
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone)]
pub struct AlternateSetting {
    /// bAlternateSetting.
    pub alternate: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class-specific descriptor bytes that followed this setting in the
    /// configuration, concatenated. Parsed by the protocol layer.
    pub extra: Vec<u8>,
}

impl AlternateSetting {
    /// The isochronous IN endpoint of this setting, if any.
    pub fn iso_in_endpoint(&self) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|e| e.is_iso_in())
    }
}

/// One interface with all of its alternate settings.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber.
    pub number: u8,
    pub class_code: u8,
    pub subclass: u8,
    /// Alternate 0 first.
    pub alternates: Vec<AlternateSetting>,
}

impl InterfaceDescriptor {
    pub fn matches(&self, class_code: u8, subclass: u8) -> bool {
        self.class_code == class_code && self.subclass == subclass
    }
}

/// The active configuration of a device, as enumerated by the host.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfiguration {
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceConfiguration {
    /// First interface matching the given class/subclass pair.
    pub fn find_interface(&self, class_code: u8, subclass: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.matches(class_code, subclass))
    }

    pub fn interface(&self, number: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.number == number)
    }
}

/// Completion status of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    Ok,
    Failed(ErrorKind),
}

impl PacketStatus {
    pub fn is_ok(self) -> bool {
        self == PacketStatus::Ok
    }
}

/// One isochronous packet descriptor. The transport fills `actual_length`
/// and `status` on completion; payload for packet `i` lives at offset
/// `i * request_length` in the transfer buffer regardless of how much the
/// preceding packets carried.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket {
    pub request_length: u32,
    pub actual_length: u32,
    pub status: PacketStatus,
}

impl IsoPacket {
    pub fn with_request_length(request_length: u32) -> Self {
        Self {
            request_length,
            actual_length: 0,
            status: PacketStatus::Ok,
        }
    }
}

/// A device handle. Control transfers on the default pipe serialize with
/// streaming submissions on the same device; implementations provide that
/// through interior locking.
pub trait UsbDevice: Send + Sync {
    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;

    /// The active configuration's descriptor tree.
    fn configuration(&self) -> &DeviceConfiguration;

    /// IN control transfer on the default pipe. Returns bytes received.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> TransportResult<usize>;

    /// OUT control transfer on the default pipe. Returns bytes sent.
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> TransportResult<usize>;

    /// Opens an isochronous IN endpoint of the currently selected alternate.
    fn open_iso_in(&self, address: u8) -> TransportResult<Box<dyn UsbIsoEndpoint>>;

    /// Opens a bulk IN endpoint.
    fn open_bulk_in(&self, address: u8) -> TransportResult<Box<dyn UsbBulkEndpoint>>;

    /// Best-effort endpoint halt recovery after a stall.
    fn clear_halt(&self, address: u8) -> TransportResult<()>;
}

/// An open isochronous IN endpoint.
pub trait UsbIsoEndpoint: Send {
    /// Submits one transfer covering `packets.len()` packet slots and blocks
    /// until completion. Per-packet results land in `packets`; the return
    /// value is the total bytes received across successful packets. The
    /// transport delivers packets in bus order.
    fn submit(&mut self, buffer: &mut [u8], packets: &mut [IsoPacket]) -> TransportResult<usize>;
}

/// An open bulk IN endpoint.
pub trait UsbBulkEndpoint: Send {
    /// One bulk IN transfer; returns bytes received.
    fn transfer(&mut self, buffer: &mut [u8]) -> TransportResult<usize>;
}
