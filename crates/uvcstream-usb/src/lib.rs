//! Host USB transport contract.
//!
//! The actual transfer primitives (control, bulk, isochronous) are provided
//! by the host OS; this crate defines the traits the streaming core drives
//! them through, the closed transport error taxonomy, and the shared retry
//! policy with exponential backoff.

mod device;
mod error;
mod histogram;
mod retry;

pub use device::{
    AlternateSetting, DeviceConfiguration, Direction, EndpointDescriptor, InterfaceDescriptor,
    IsoPacket, PacketStatus, TransferType, UsbBulkEndpoint, UsbDevice, UsbIsoEndpoint,
};
pub use error::{ErrorKind, RecoveryAction, TransportError};
pub use histogram::ErrorHistogram;
pub use retry::{
    backoff_delay, bulk_transfer_with_retry, control_in_with_retry, control_out_with_retry,
    RetryConfig,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
