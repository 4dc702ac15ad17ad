//! Response frame allocation and the inbound/outbound frame queues.
//!
//! A [`Frame`] is a single owned Ethernet frame tied to the interface it
//! arrived on (or will leave through). Buffers are zero-filled on
//! allocation and never shorter than the Ethernet minimum, so trimming a
//! reply below 60 bytes leaves zero padding on the wire rather than stale
//! request bytes.
//!
//! Ownership is linear: producer, queue, consumer. The payload region of
//! an in-flight ATA frame doubles as the backing device's I/O buffer, so
//! a frame parked in a request slot must not be touched until its
//! completion fires.

use crate::net::NetIf;
use crate::protocol::types::ETH_ZLEN;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// One owned Ethernet frame plus its interface.
pub struct Frame {
    iface: Arc<dyn NetIf>,
    buf: Vec<u8>,
}

impl Frame {
    /// Allocate a zero-filled response frame of at least `len` bytes
    /// (padded up to the Ethernet minimum).
    pub fn response(iface: Arc<dyn NetIf>, len: usize) -> Frame {
        Frame {
            iface,
            buf: vec![0u8; len.max(ETH_ZLEN)],
        }
    }

    /// Copy a received frame into an owned buffer.
    pub fn inbound(iface: Arc<dyn NetIf>, bytes: &[u8]) -> Frame {
        let mut buf = vec![0u8; bytes.len().max(ETH_ZLEN)];
        buf[..bytes.len()].copy_from_slice(bytes);
        Frame { iface, buf }
    }

    pub fn iface(&self) -> &Arc<dyn NetIf> {
        &self.iface
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Shorten the frame to `len` bytes, clamped to the Ethernet minimum.
    /// Bytes between `len` and the clamped length are zeroed so short
    /// replies go out zero-padded.
    pub fn trim(&mut self, len: usize) {
        let new_len = len.max(ETH_ZLEN).min(self.buf.len());
        self.buf.truncate(new_len);
        if len < new_len {
            self.buf[len..].fill(0);
        }
    }
}

/// Multi-producer, single-consumer frame queue.
pub struct FrameQueue {
    q: Mutex<VecDeque<Frame>>,
}

impl FrameQueue {
    pub fn new() -> FrameQueue {
        FrameQueue {
            q: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, f: Frame) {
        self.q.lock().unwrap().push_back(f);
    }

    pub fn pop(&self) -> Option<Frame> {
        self.q.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.lock().unwrap().len()
    }

    /// Drop everything still queued.
    pub fn purge(&self) {
        self.q.lock().unwrap().clear();
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakeup latch for the service worker. A wake that lands while the
/// worker is draining is remembered, so the next `wait` returns
/// immediately instead of sleeping through it.
pub struct Waker {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Waker {
    pub fn new() -> Waker {
        Waker {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn wake(&self) {
        *self.pending.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.cv.wait(pending).unwrap();
        }
        *pending = false;
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::new()
    }
}
