//! Transport error taxonomy and recovery actions.

use thiserror::Error;

/// Errors that can occur during USB transfers.
///
/// This is a closed set: host-specific error codes must be mapped onto one of
/// these variants by the transport implementation before they reach the
/// streaming core.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transfer deadline exceeded.
    #[error("transfer timed out")]
    Timeout,

    /// Endpoint halted; may self-clear after a stall recovery.
    #[error("endpoint stalled")]
    Stall,

    /// Data corruption or data overrun on the wire.
    #[error("CRC/data error")]
    Crc,

    /// FIFO overrun or data underrun.
    #[error("buffer overflow")]
    Overflow,

    /// Device gone. Never retried.
    #[error("device disconnected")]
    Disconnected,

    /// Anything the transport could not classify.
    #[error("transport error: {0}")]
    Unknown(String),
}

impl TransportError {
    /// The classification of this error, for histograms and recovery policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Stall => ErrorKind::Stall,
            TransportError::Crc => ErrorKind::Crc,
            TransportError::Overflow => ErrorKind::Overflow,
            TransportError::Disconnected => ErrorKind::Disconnected,
            TransportError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// True when retrying the transfer cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}

/// Error classification used for statistics and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Stall,
    Crc,
    Overflow,
    Disconnected,
    Unknown,
}

impl ErrorKind {
    /// Number of distinct kinds, for histogram sizing.
    pub const COUNT: usize = 6;

    /// Stable index of this kind within [0, COUNT).
    pub fn index(self) -> usize {
        match self {
            ErrorKind::Timeout => 0,
            ErrorKind::Stall => 1,
            ErrorKind::Crc => 2,
            ErrorKind::Overflow => 3,
            ErrorKind::Disconnected => 4,
            ErrorKind::Unknown => 5,
        }
    }

    /// The default recovery action for this kind of error.
    pub fn recommended_action(self) -> RecoveryAction {
        match self {
            ErrorKind::Timeout => RecoveryAction::Retry,
            ErrorKind::Stall => RecoveryAction::ResetEndpoint,
            ErrorKind::Crc => RecoveryAction::Retry,
            ErrorKind::Overflow => RecoveryAction::ReduceBandwidth,
            ErrorKind::Disconnected => RecoveryAction::Fatal,
            ErrorKind::Unknown => RecoveryAction::Retry,
        }
    }
}

/// Recovery actions, ordered from least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryAction {
    None,
    Retry,
    ResetEndpoint,
    ReduceBandwidth,
    RestartTransfer,
    DeviceReset,
    Fatal,
}

impl RecoveryAction {
    /// Escalates `Retry` to `RestartTransfer` once the error window shows the
    /// link is not recovering on its own.
    pub fn escalate(self, window_loss_percent: f32, consecutive_errors: u32) -> RecoveryAction {
        const LOSS_ESCALATION_PERCENT: f32 = 10.0;
        const CONSECUTIVE_ESCALATION: u32 = 20;

        if self == RecoveryAction::Retry
            && (window_loss_percent >= LOSS_ESCALATION_PERCENT
                || consecutive_errors >= CONSECUTIVE_ESCALATION)
        {
            RecoveryAction::RestartTransfer
        } else {
            self
        }
    }
}
