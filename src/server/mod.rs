//! The target server: registry, request engines, and the service worker
//! that ties the queues together.

pub mod ata;
pub mod cfg;
pub mod registry;
pub mod service;
pub mod tree;

pub use registry::{AddError, DelError, Registry, Target};
pub use service::Service;

use crate::frame::{Frame, FrameQueue, Waker};

/// Outbound queue plus the service worker's wakeup latch.
///
/// Everything that produces work for the service worker goes through
/// here: completed I/O and tree replies land in the queue, while the
/// inbound path only kicks the latch. One latch serves both directions,
/// the worker drains both queues whenever it wakes.
pub struct Egress {
    q: FrameQueue,
    waker: Waker,
}

impl Egress {
    pub fn new() -> Egress {
        Egress {
            q: FrameQueue::new(),
            waker: Waker::new(),
        }
    }

    /// Queue a frame for transmission and wake the worker.
    pub fn send(&self, f: Frame) {
        self.q.push(f);
        self.waker.wake();
    }

    /// Wake the worker without queueing anything.
    pub fn kick(&self) {
        self.waker.wake();
    }

    pub fn pop(&self) -> Option<Frame> {
        self.q.pop()
    }

    pub fn wait(&self) {
        self.waker.wait()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn purge(&self) {
        self.q.purge()
    }
}

impl Default for Egress {
    fn default() -> Self {
        Self::new()
    }
}
