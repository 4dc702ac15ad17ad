//! File-backed block device.
//!
//! Opens a regular file or block device read-write and serves transfers
//! from a dedicated I/O thread, so `submit` stays a non-blocking channel
//! send and completions run off the service worker. Capacity is probed
//! by seeking to the end, which works for block devices where metadata
//! length does not.

use super::{BlockDev, IoDir, SectorIo, StorageError};
use crate::protocol::types::SECTOR_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Block device served from a file by one I/O thread.
pub struct FileBackend {
    sectors: u64,
    tx: Mutex<Option<Sender<SectorIo>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileBackend {
    /// Open `path` read-write. Fails if it cannot be opened or has zero
    /// capacity probes; capacity is truncated to whole sectors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileBackend, StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let bytes = file.seek(SeekFrom::End(0))?;
        let sectors = bytes / SECTOR_SIZE as u64;

        let (tx, rx) = mpsc::channel::<SectorIo>();
        let worker = thread::Builder::new()
            .name("kvblade-io".to_string())
            .spawn(move || io_loop(file, rx))?;

        Ok(FileBackend {
            sectors,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl BlockDev for FileBackend {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn submit(&self, io: SectorIo) {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::SendError(io)) = tx.send(io) {
                    (io.done)(io.frame, Err(StorageError::Gone));
                }
            }
            None => (io.done)(io.frame, Err(StorageError::Gone)),
        }
    }
}

impl Drop for FileBackend {
    /// Close the submit side and wait for queued transfers to complete.
    fn drop(&mut self) {
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn io_loop(mut file: File, rx: mpsc::Receiver<SectorIo>) {
    while let Ok(mut io) = rx.recv() {
        let len = io.len;
        let res = transfer(&mut file, &mut io)
            .map(|_| len)
            .map_err(StorageError::Io);
        (io.done)(io.frame, res);
    }
}

fn transfer(file: &mut File, io: &mut SectorIo) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(io.lba * SECTOR_SIZE as u64))?;
    let range = io.off..io.off + io.len;
    match io.dir {
        IoDir::Read => file.read_exact(&mut io.frame.bytes_mut()[range]),
        IoDir::Write => {
            file.write_all(&io.frame.bytes()[range])?;
            file.flush()
        }
    }
}
