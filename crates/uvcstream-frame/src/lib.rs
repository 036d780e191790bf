//! Frame assembly: buffers, pool, queue, deframer.
//!
//! The transfer pump writes raw UVC payload packets in on one side; the
//! consumer takes whole frames out on the other. Frame buffers are recycled
//! through a pool, and the ready queue is bounded so a stalled consumer can
//! never grow memory without limit.

mod deframer;
mod frame;
mod pool;
mod queue;

pub use deframer::{Deframer, DeframerStats};
pub use frame::FrameBuffer;
pub use pool::{FramePool, PoolStats};
pub use queue::{FrameQueue, WaitFrameError};

/// Default bound of the ready-frame queue.
pub const MAX_QUEUED_FRAMES: usize = 8;

/// Default capacity of the recycling pool.
pub const FRAME_POOL_CAPACITY: usize = 12;

/// Largest raw frame the deframer will assemble (1080p YUY2).
pub const MAX_RAW_FRAME_SIZE: usize = 1920 * 1080 * 2;
