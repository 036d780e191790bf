//! Bounded FIFO of ready frames.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::FrameBuffer;

/// Why a wait for a frame returned without one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitFrameError {
    #[error("timed out waiting for a frame")]
    TimedOut,
    #[error("frame queue closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<FrameBuffer>,
    closed: bool,
}

/// Bounded producer/consumer queue of completed frames. The producer never
/// blocks: pushing into a full queue fails and the frame is dropped by the
/// caller. The consumer waits on a condition variable signalled per publish.
#[derive(Debug)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    max_depth: usize,
}

impl FrameQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            max_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().frames.len() >= self.max_depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Enqueues a frame unless the queue is at its bound; on overflow the
    /// frame is handed back so the caller can recycle it.
    pub fn try_push(&self, frame: FrameBuffer) -> Result<(), FrameBuffer> {
        let mut state = self.state.lock();
        if state.closed || state.frames.len() >= self.max_depth {
            return Err(frame);
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<FrameBuffer> {
        self.state.lock().frames.pop_front()
    }

    /// Blocks until a frame is available, the queue is closed, or `timeout`
    /// elapses.
    pub fn wait(&self, timeout: Duration) -> Result<(), WaitFrameError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(WaitFrameError::Closed);
            }
            if !state.frames.is_empty() {
                return Ok(());
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return if state.closed {
                    Err(WaitFrameError::Closed)
                } else if state.frames.is_empty() {
                    Err(WaitFrameError::TimedOut)
                } else {
                    Ok(())
                };
            }
        }
    }

    /// Drops all queued frames, returning them for recycling.
    pub fn drain(&self) -> Vec<FrameBuffer> {
        self.state.lock().frames.drain(..).collect()
    }

    /// Closes the queue and wakes any waiter. Used on stream stop.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Reopens after a close, for stream restart.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }
}
