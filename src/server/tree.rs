//! Tree engine: the bounded worker pool behind the vendor commands.
//!
//! The classifier never calls the tree store directly. It parks the
//! response frame in a [`TreeWork`] item and hands it to the pool; a
//! worker runs the backend operation, writes the status (and, for
//! inserts, the assigned nid) into the sub-header, trims, and queues the
//! reply. The submit queue is bounded; when it is full the work is
//! refused and the caller drops the frame.

use crate::frame::Frame;
use crate::protocol::types::*;
use crate::protocol::{build, parse};
use crate::server::registry::Target;
use crate::server::Egress;
use crate::tree::{TreeStore, TREE_K};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Queue depth of the pool; submissions beyond this are refused.
pub const TREE_QUEUE_DEPTH: usize = 256;

/// Worker threads serving the queue.
pub const TREE_WORKERS: usize = 4;

/// One deferred tree request: the owning target and its parked reply.
pub struct TreeWork {
    pub target: Arc<Target>,
    pub frame: Frame,
}

/// Bounded pool of tree workers.
pub struct TreePool {
    tx: Mutex<Option<SyncSender<TreeWork>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl TreePool {
    pub fn new(store: Arc<dyn TreeStore>, egress: Arc<Egress>, nworkers: usize) -> TreePool {
        let (tx, rx) = mpsc::sync_channel::<TreeWork>(TREE_QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let workers = (0..nworkers)
            .map(|i| {
                let rx = rx.clone();
                let store = store.clone();
                let egress = egress.clone();
                let pending = pending.clone();
                thread::Builder::new()
                    .name(format!("kvblade-tree{i}"))
                    .spawn(move || loop {
                        let work = match rx.lock().unwrap().recv() {
                            Ok(w) => w,
                            Err(_) => break,
                        };
                        run(store.as_ref(), &egress, work);
                        let (count, cv) = &*pending;
                        *count.lock().unwrap() -= 1;
                        cv.notify_all();
                    })
                    .expect("spawn tree worker")
            })
            .collect();

        TreePool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
        }
    }

    /// Queue one work item. Gives the item back when the queue is full
    /// or the pool is gone.
    pub fn submit(&self, work: TreeWork) -> Result<(), TreeWork> {
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return Err(work);
        };

        let (count, _) = &*self.pending;
        *count.lock().unwrap() += 1;
        match tx.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(w)) | Err(TrySendError::Disconnected(w)) => {
                let (count, cv) = &*self.pending;
                *count.lock().unwrap() -= 1;
                cv.notify_all();
                Err(w)
            }
        }
    }

    /// Wait until every submitted item has been fully processed.
    pub fn flush(&self) {
        let (count, cv) = &*self.pending;
        let mut n = count.lock().unwrap();
        while *n > 0 {
            n = cv.wait(n).unwrap();
        }
    }

    /// Close the queue and join the workers.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Execute one tree command against the store and queue the reply.
fn run(store: &dyn TreeStore, egress: &Egress, work: TreeWork) {
    let TreeWork { target, mut frame } = work;

    let command = frame.bytes()[OFF_CMD];
    let tid = parse::tree_tid(frame.bytes());
    let nid = parse::tree_nid(frame.bytes());
    let off = parse::tree_off(frame.bytes());
    let len = parse::tree_len(frame.bytes());
    let cap = frame.len();

    let final_len = match command {
        cmd::CREATETREE => {
            let buf = frame.bytes_mut();
            match store.create_tree(TREE_K) {
                0 => build::set_tree_err(buf, -libc::ENOMEM),
                tid => {
                    build::set_tree_tid(buf, tid);
                    build::set_tree_err(buf, 0);
                }
            }
            TREE_DATA_OFF
        }
        cmd::REMOVETREE => {
            let err = store.remove_tree(tid);
            build::set_tree_err(frame.bytes_mut(), err);
            TREE_DATA_OFF
        }
        cmd::INSERTNODE => {
            let mut new_nid = 0u64;
            let err = store.insert_node(tid, &mut new_nid);
            let buf = frame.bytes_mut();
            build::set_tree_nid(buf, new_nid);
            build::set_tree_err(buf, err);
            TREE_DATA_OFF
        }
        cmd::REMOVENODE => {
            let err = store.remove_node(tid, nid);
            build::set_tree_err(frame.bytes_mut(), err);
            TREE_DATA_OFF
        }
        cmd::UPDATENODE => {
            let n = len as usize;
            let err = if n > cap - TREE_DATA_OFF {
                -libc::EINVAL
            } else {
                store.write_node(tid, nid, off, &frame.bytes()[TREE_DATA_OFF..TREE_DATA_OFF + n])
            };
            build::set_tree_err(frame.bytes_mut(), err);
            TREE_DATA_OFF
        }
        cmd::READNODE => {
            // only 32 bits of the length survive the wire
            let n = (len & 0xFFFF_FFFF) as usize;
            if n > cap - TREE_DATA_OFF {
                build::set_tree_err(frame.bytes_mut(), -libc::EINVAL);
                TREE_DATA_OFF
            } else {
                let buf = frame.bytes_mut();
                let err = store.read_node(tid, nid, off, &mut buf[TREE_DATA_OFF..TREE_DATA_OFF + n]);
                build::set_tree_err(buf, err);
                if err == 0 {
                    TREE_DATA_OFF + n
                } else {
                    // no payload on a failed read
                    TREE_DATA_OFF
                }
            }
        }
        other => {
            log::warn!("unknown tree command 0x{other:02X}, dropping");
            target.dec_busy();
            return;
        }
    };

    frame.trim(final_len);
    target.dec_busy();
    egress.send(frame);
}
