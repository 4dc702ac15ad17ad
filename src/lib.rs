//! kvblade: a virtual EtherDrive(R) blade.
//!
//! Exposes local block devices as AoE targets on raw Ethernet
//! interfaces, and serves a vendor-specific tree-node command family
//! against a key-addressed tree store. One service worker drains the
//! inbound and outbound frame queues; ATA sector I/O completes
//! asynchronously through per-target request slots and tree commands
//! run on a bounded worker pool.

pub mod config;
pub mod frame;
pub mod mgmt;
pub mod net;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tree;

pub use config::Config;
pub use net::NetIf;
pub use server::{AddError, DelError, Service, Target};
pub use storage::{BlockDev, FileBackend, SectorIo, StorageError};
pub use tree::{MemTreeStore, TreeStore};
