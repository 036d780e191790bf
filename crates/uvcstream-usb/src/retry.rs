//! Transfer retry with exponential backoff.
//!
//! Control and bulk transfers retry transient failures; isochronous streaming
//! never retries a whole transfer (packet loss is normal there) and is handled
//! by the pump instead.

use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::{TransportResult, UsbBulkEndpoint, UsbDevice};

/// Retry policy for control and bulk transfers.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Quicker policy for transfers on the streaming path, where a long stall
    /// is worse than a dropped buffer.
    pub fn streaming() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay before retry number `attempt` (0-based): initial * multiplier^attempt,
/// capped at max_delay.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let mut delay = config.initial_delay;
    for _ in 0..attempt {
        delay = delay.mul_f32(config.backoff_multiplier);
        if delay > config.max_delay {
            return config.max_delay;
        }
    }
    delay.min(config.max_delay)
}

/// IN control transfer with retry. Gives up immediately on disconnect.
pub fn control_in_with_retry(
    device: &dyn UsbDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &mut [u8],
    config: &RetryConfig,
) -> TransportResult<usize> {
    let mut attempt = 0;
    loop {
        match device.control_in(request_type, request, value, index, data) {
            Ok(len) => return Ok(len),
            Err(err) if err.is_fatal() => {
                error!("control IN aborted: {err}");
                return Err(err);
            }
            Err(err) if attempt < config.max_retries => {
                let delay = backoff_delay(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "control IN failed ({err}), retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                error!(retries = config.max_retries, "control IN failed: {err}");
                return Err(err);
            }
        }
    }
}

/// OUT control transfer with retry. Gives up immediately on disconnect.
pub fn control_out_with_retry(
    device: &dyn UsbDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
    config: &RetryConfig,
) -> TransportResult<usize> {
    let mut attempt = 0;
    loop {
        match device.control_out(request_type, request, value, index, data) {
            Ok(len) => return Ok(len),
            Err(err) if err.is_fatal() => {
                error!("control OUT aborted: {err}");
                return Err(err);
            }
            Err(err) if attempt < config.max_retries => {
                let delay = backoff_delay(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "control OUT failed ({err}), retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                error!(retries = config.max_retries, "control OUT failed: {err}");
                return Err(err);
            }
        }
    }
}

/// Bulk IN transfer with retry. A stalled endpoint gets a best-effort halt
/// clear through `clear_halt` before the next attempt.
pub fn bulk_transfer_with_retry(
    device: &dyn UsbDevice,
    endpoint: &mut dyn UsbBulkEndpoint,
    address: u8,
    buffer: &mut [u8],
    config: &RetryConfig,
) -> TransportResult<usize> {
    let mut attempt = 0;
    loop {
        match endpoint.transfer(buffer) {
            Ok(len) => return Ok(len),
            Err(err) if err.is_fatal() => {
                error!("bulk IN aborted: {err}");
                return Err(err);
            }
            Err(err) if attempt < config.max_retries => {
                if matches!(err, crate::TransportError::Stall) {
                    warn!("bulk endpoint stalled, attempting halt clear");
                    if let Err(clear_err) = device.clear_halt(address) {
                        warn!("halt clear failed: {clear_err}");
                    }
                }
                let delay = backoff_delay(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "bulk IN failed ({err}), retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                error!(retries = config.max_retries, "bulk IN failed: {err}");
                return Err(err);
            }
        }
    }
}
