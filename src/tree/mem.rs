//! In-memory tree store.
//!
//! Stands in for the external store so the server runs self-contained.
//! Trees and nodes get sequential ids starting at 1; node data grows on
//! write and reads past the written extent see zeros.

use super::{TreeStore, TREE_STATUS_GONE};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tree {
    #[allow(dead_code)]
    k: u8,
    next_nid: u64,
    nodes: HashMap<u64, Vec<u8>>,
}

/// Heap-backed [`TreeStore`].
pub struct MemTreeStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_tid: u64,
    trees: HashMap<u64, Tree>,
}

impl MemTreeStore {
    pub fn new() -> MemTreeStore {
        MemTreeStore {
            inner: Mutex::new(Inner {
                next_tid: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore for MemTreeStore {
    fn create_tree(&self, k: u8) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let tid = inner.next_tid;
        inner.next_tid += 1;
        inner.trees.insert(
            tid,
            Tree {
                k,
                next_nid: 1,
                nodes: HashMap::new(),
            },
        );
        tid
    }

    fn remove_tree(&self, tid: u64) -> i32 {
        match self.inner.lock().unwrap().trees.remove(&tid) {
            Some(_) => 0,
            None => TREE_STATUS_GONE,
        }
    }

    fn insert_node(&self, tid: u64, nid: &mut u64) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let Some(tree) = inner.trees.get_mut(&tid) else {
            return -libc::ENOENT;
        };
        let id = tree.next_nid;
        tree.next_nid += 1;
        tree.nodes.insert(id, Vec::new());
        *nid = id;
        0
    }

    fn remove_node(&self, tid: u64, nid: u64) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let Some(tree) = inner.trees.get_mut(&tid) else {
            return TREE_STATUS_GONE;
        };
        match tree.nodes.remove(&nid) {
            Some(_) => 0,
            None => TREE_STATUS_GONE,
        }
    }

    fn read_node(&self, tid: u64, nid: u64, off: u64, buf: &mut [u8]) -> i32 {
        let inner = self.inner.lock().unwrap();
        let Some(data) = inner.trees.get(&tid).and_then(|t| t.nodes.get(&nid)) else {
            return -libc::ENOENT;
        };

        buf.fill(0);
        let off = off as usize;
        if off < data.len() {
            let n = buf.len().min(data.len() - off);
            buf[..n].copy_from_slice(&data[off..off + n]);
        }
        0
    }

    fn write_node(&self, tid: u64, nid: u64, off: u64, data: &[u8]) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.trees.get_mut(&tid).and_then(|t| t.nodes.get_mut(&nid)) else {
            return -libc::ENOENT;
        };

        let off = off as usize;
        let end = off + data.len();
        if node.len() < end {
            node.resize(end, 0);
        }
        node[off..end].copy_from_slice(data);
        0
    }
}
