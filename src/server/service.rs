//! Service lifecycle and the worker that drives everything.
//!
//! One worker thread owns both queues: it drains inbound frames through
//! the classifier and pumps the outbound queue to the interfaces,
//! sleeping on the egress latch between bursts. Backends wake it via
//! their completions. A second small thread logs the packet counter
//! every ten seconds.
//!
//! The registry lock is held across the whole per-frame fan-out, so all
//! per-target work started inside it is enqueue-only: block I/O is a
//! channel send into the backend, tree work a bounded-queue send into
//! the pool.

use crate::frame::{Frame, FrameQueue};
use crate::net::{NetError, NetIf, PnetIf};
use crate::protocol::types::*;
use crate::protocol::{build, parse};
use crate::server::registry::{AddError, DelError, Registry, Target};
use crate::server::tree::{TreePool, TreeWork, TREE_WORKERS};
use crate::server::{ata, cfg, Egress};
use crate::storage::FileBackend;
use crate::tree::TreeStore;
use pnet::datalink::DataLinkReceiver;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Interval of the packet-counter log line.
const COUNTER_PERIOD: Duration = Duration::from_secs(10);

/// Backoff while waiting for a target's in-flight requests to drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Accepted-frame counter: remainder rolls over every thousand.
pub struct Counter {
    count: AtomicU64,
    kcount: AtomicU64,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            count: AtomicU64::new(0),
            kcount: AtomicU64::new(0),
        }
    }

    /// Single writer: only the service worker increments.
    fn inc(&self) {
        let next = self.count.load(Ordering::Relaxed) + 1;
        if next == 1000 {
            self.count.store(0, Ordering::Relaxed);
            self.kcount.fetch_add(1, Ordering::Relaxed);
        } else {
            self.count.store(next, Ordering::Relaxed);
        }
    }

    /// (thousands, remainder)
    pub fn read(&self) -> (u64, u64) {
        (
            self.kcount.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
        )
    }
}

/// State shared between the worker, backends, and the management side.
struct Shared {
    registry: Registry,
    inq: FrameQueue,
    egress: Arc<Egress>,
    pool: TreePool,
    counter: Counter,
    ifaces: Mutex<HashMap<String, Arc<dyn NetIf>>>,
    stop: AtomicBool,
}

/// The AoE target server.
pub struct Service {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_stop: Arc<(Mutex<bool>, Condvar)>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    rx_running: Arc<AtomicBool>,
}

impl Service {
    /// Bring up queues, the tree pool, the service worker, and the
    /// counter timer. Interfaces and targets are attached afterwards.
    pub fn new(store: Arc<dyn TreeStore>) -> Service {
        let egress = Arc::new(Egress::new());
        let pool = TreePool::new(store, egress.clone(), TREE_WORKERS);

        let shared = Arc::new(Shared {
            registry: Registry::new(),
            inq: FrameQueue::new(),
            egress,
            pool,
            counter: Counter::new(),
            ifaces: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("kvblade".to_string())
                .spawn(move || worker_loop(&shared))
                .expect("spawn service worker")
        };

        let timer_stop = Arc::new((Mutex::new(false), Condvar::new()));
        let timer = {
            let shared = shared.clone();
            let stop = timer_stop.clone();
            thread::Builder::new()
                .name("kvblade-timer".to_string())
                .spawn(move || timer_loop(&shared, &stop))
                .expect("spawn counter timer")
        };

        Service {
            shared,
            worker: Some(worker),
            timer: Some(timer),
            timer_stop,
            pumps: Mutex::new(Vec::new()),
            rx_running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make an interface available for targets. Frames are only received
    /// through [`attach_interface`](Self::attach_interface) or
    /// [`push_inbound`](Self::push_inbound).
    pub fn register_iface(&self, iface: Arc<dyn NetIf>) {
        self.shared
            .ifaces
            .lock()
            .unwrap()
            .insert(iface.name().to_string(), iface);
    }

    /// Open a pnet interface and start its receive pump.
    pub fn attach_interface(&self, name: &str) -> Result<(), NetError> {
        let (iface, rx) = PnetIf::open(name)?;
        let iface: Arc<dyn NetIf> = Arc::new(iface);
        self.register_iface(iface.clone());

        let shared = self.shared.clone();
        let running = self.rx_running.clone();
        let pump = thread::Builder::new()
            .name(format!("kvblade-rx-{name}"))
            .spawn(move || rx_pump(rx, &iface, &shared, &running))
            .map_err(NetError::Io)?;
        self.pumps.lock().unwrap().push(pump);

        log::info!("listening on {name}");
        Ok(())
    }

    /// Hand a raw received frame to the service. Responses and non-AoE
    /// traffic are refused at the door. Returns whether the frame was
    /// queued.
    pub fn push_inbound(&self, ifname: &str, bytes: &[u8]) -> bool {
        let iface = self.shared.ifaces.lock().unwrap().get(ifname).cloned();
        match iface {
            Some(iface) => deliver(&self.shared, &iface, bytes),
            None => false,
        }
    }

    /// Export `path` as blade (major, minor) on `ifname`.
    pub fn add(&self, major: u16, minor: u8, ifname: &str, path: &str) -> Result<(), AddError> {
        if !self.shared.ifaces.lock().unwrap().contains_key(ifname) {
            return Err(AddError::NoInterface);
        }
        let dev = FileBackend::open(path)?;
        let bdev_id = bdev_identity(path);
        self.add_device(major, minor, ifname, Box::new(dev), path, bdev_id)
    }

    /// Export an already opened device. Used by `add` and by tests that
    /// bring their own backend.
    pub fn add_device(
        &self,
        major: u16,
        minor: u8,
        ifname: &str,
        dev: Box<dyn crate::storage::BlockDev>,
        path: &str,
        bdev_id: String,
    ) -> Result<(), AddError> {
        let iface = self
            .shared
            .ifaces
            .lock()
            .unwrap()
            .get(ifname)
            .cloned()
            .ok_or(AddError::NoInterface)?;
        if dev.sectors() == 0 {
            return Err(AddError::ZeroCapacity);
        }

        let target = Arc::new(Target::new(
            major,
            minor,
            iface,
            dev,
            path,
            bdev_id,
            DEFAULT_MODEL,
            DEFAULT_SERIAL,
        ));
        self.shared.registry.add(target.clone())?;

        log::info!(
            "added {} as {}.{}@{}: {} sectors",
            path,
            major,
            minor,
            ifname,
            target.sectors()
        );
        self.shared
            .egress
            .send(build::announce(&target.iface, major, minor, &target.config()));
        Ok(())
    }

    /// Remove a blade; refused while it has requests in flight.
    pub fn del(&self, major: u16, minor: u8, ifname: &str) -> Result<(), DelError> {
        let target = self.shared.registry.del(major, minor, ifname)?;
        log::info!("removed {}.{}@{}", major, minor, ifname);
        drop(target);
        Ok(())
    }

    pub fn target(&self, major: u16, minor: u8, ifname: &str) -> Option<Arc<Target>> {
        self.shared.registry.find(major, minor, ifname)
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.shared.registry.snapshot()
    }

    /// Current packet counter as (thousands, remainder).
    pub fn packet_count(&self) -> (u64, u64) {
        self.shared.counter.read()
    }

    /// Orderly teardown: stop the timer, drain the tree pool, stop
    /// receive, wait out every target's in-flight I/O, then stop the
    /// worker and purge whatever is left.
    pub fn shutdown(mut self) {
        log::info!("kvblade shutting down");

        {
            let (stopped, cv) = &*self.timer_stop;
            *stopped.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }

        self.rx_running.store(false, Ordering::Release);
        for pump in self.pumps.lock().unwrap().drain(..) {
            let _ = pump.join();
        }

        self.shared.pool.flush();

        let targets = self.shared.registry.drain();
        for target in targets {
            while target.busy() > 0 {
                thread::sleep(DRAIN_POLL);
            }
        }

        self.shared.stop.store(true, Ordering::Release);
        self.shared.egress.kick();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.shared.inq.purge();
        self.shared.egress.purge();
        self.shared.pool.shutdown();
    }
}

/// Filter and queue one received frame.
fn deliver(shared: &Shared, iface: &Arc<dyn NetIf>, bytes: &[u8]) -> bool {
    if bytes.len() < AOE_HDR_LEN {
        return false;
    }
    let ethertype = u16::from_be_bytes([bytes[OFF_ETHERTYPE], bytes[OFF_ETHERTYPE + 1]]);
    if ethertype != AOE_ETHERTYPE || bytes[OFF_VERFL] & AOEFL_RSP != 0 {
        return false;
    }
    shared.inq.push(Frame::inbound(iface.clone(), bytes));
    shared.egress.kick();
    true
}

fn rx_pump(
    mut rx: Box<dyn DataLinkReceiver>,
    iface: &Arc<dyn NetIf>,
    shared: &Shared,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        match rx.next() {
            Ok(packet) => {
                deliver(shared, iface, packet);
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                log::error!("receive error on {}: {}", iface.name(), e);
                break;
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        loop {
            let mut progressed = false;
            if let Some(frame) = shared.inq.pop() {
                ingress(shared, frame);
                progressed = true;
            }
            if let Some(frame) = shared.egress.pop() {
                if let Err(e) = frame.iface().transmit(frame.bytes()) {
                    log::warn!("transmit failed on {}: {}", frame.iface().name(), e);
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.egress.wait();
    }
}

/// Classify one inbound frame and fan it out to every matching target.
fn ingress(shared: &Shared, frame: Frame) {
    let request = match parse::request(frame.bytes()) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("dropping frame: {e}");
            return;
        }
    };

    let ifname = frame.iface().name().to_string();
    shared
        .registry
        .for_each_matching(request.major, request.minor, &ifname, |target| {
            shared.counter.inc();
            let response = build::make_response(&frame, target.major, target.minor);

            match request.cmd {
                cmd::CFG => {
                    let mut response = response;
                    if cfg::respond(target, &mut response) {
                        shared.egress.send(response);
                    }
                }
                cmd::ATA => {
                    if let Some(response) = ata::dispatch(&shared.egress, target, response) {
                        shared.egress.send(response);
                    }
                }
                c if is_tree_cmd(c) => {
                    target.inc_busy();
                    let work = TreeWork {
                        target: target.clone(),
                        frame: response,
                    };
                    if shared.pool.submit(work).is_err() {
                        log::warn!("tree queue full, dropping command 0x{c:02X}");
                        target.dec_busy();
                    }
                }
                other => {
                    log::debug!("unhandled command 0x{other:02X}");
                }
            }
        });
    // inbound frame dropped here, after the fan-out
}

fn timer_loop(shared: &Shared, stop: &(Mutex<bool>, Condvar)) {
    let (stopped, cv) = stop;
    let mut guard = stopped.lock().unwrap();
    loop {
        let (g, timeout) = cv.wait_timeout(guard, COUNTER_PERIOD).unwrap();
        guard = g;
        if *guard {
            break;
        }
        if timeout.timed_out() {
            let (kcount, count) = shared.counter.read();
            log::info!("packet count: {kcount}k, {count}");
        }
    }
}

/// Device-number identity of the backing path, "major:minor".
fn bdev_identity(path: &str) -> String {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    match std::fs::metadata(path) {
        Ok(md) => {
            let dev = if md.file_type().is_block_device() {
                md.rdev()
            } else {
                md.dev()
            };
            format!(
                "{}:{}",
                libc::major(dev as libc::dev_t),
                libc::minor(dev as libc::dev_t)
            )
        }
        Err(_) => String::new(),
    }
}
