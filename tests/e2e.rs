//! End-to-end exercises of the service: frames in through
//! `push_inbound`, replies observed at a mock interface's transmit path.

use kvblade::protocol::types::*;
use kvblade::storage::{BlockDev, SectorIo};
use kvblade::tree::MemTreeStore;
use kvblade::{NetIf, Service};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const IFNAME: &str = "mock0";
const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC];
const INITIATOR: [u8; 6] = [0x02, 0x00, 0x00, 0x11, 0x22, 0x33];

/// Interface that records every transmitted frame.
struct MockIf {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    mtu: usize,
}

impl NetIf for MockIf {
    fn name(&self) -> &str {
        IFNAME
    }
    fn mac(&self) -> [u8; 6] {
        MAC
    }
    fn mtu(&self) -> usize {
        self.mtu
    }
    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Block device that parks submissions until the test releases them.
struct StallDev {
    sectors: u64,
    parked: Arc<Mutex<Vec<SectorIo>>>,
}

impl BlockDev for StallDev {
    fn sectors(&self) -> u64 {
        self.sectors
    }
    fn submit(&self, io: SectorIo) {
        self.parked.lock().unwrap().push(io);
    }
}

fn release_all(parked: &Mutex<Vec<SectorIo>>) -> usize {
    let drained: Vec<SectorIo> = parked.lock().unwrap().drain(..).collect();
    let n = drained.len();
    for io in drained {
        let len = io.len;
        (io.done)(io.frame, Ok(len));
    }
    n
}

/// Device that completes everything immediately with zeroed data.
struct InstantDev(u64);

impl BlockDev for InstantDev {
    fn sectors(&self) -> u64 {
        self.0
    }
    fn submit(&self, io: SectorIo) {
        let len = io.len;
        (io.done)(io.frame, Ok(len));
    }
}

struct Rig {
    service: Service,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn rig(mtu: usize) -> Rig {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let service = Service::new(Arc::new(MemTreeStore::new()));
    service.register_iface(Arc::new(MockIf {
        sent: sent.clone(),
        mtu,
    }));
    Rig { service, sent }
}

impl Rig {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_frame(&self, idx: usize) -> Vec<u8> {
        self.sent.lock().unwrap()[idx].clone()
    }

    fn wait_for_sent(&self, n: usize) {
        assert!(
            wait_until(|| self.sent_count() >= n),
            "timed out waiting for {n} transmitted frames (got {})",
            self.sent_count()
        );
    }
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..600 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn request_header(major: u16, minor: u8, command: u8, tag: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len.max(ETH_ZLEN)];
    buf[OFF_DST..OFF_DST + 6].copy_from_slice(&MAC);
    buf[OFF_SRC..OFF_SRC + 6].copy_from_slice(&INITIATOR);
    buf[OFF_ETHERTYPE..OFF_ETHERTYPE + 2].copy_from_slice(&AOE_ETHERTYPE.to_be_bytes());
    buf[OFF_VERFL] = AOE_HVER;
    buf[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&major.to_be_bytes());
    buf[OFF_MINOR] = minor;
    buf[OFF_CMD] = command;
    buf[OFF_TAG..OFF_TAG + 4].copy_from_slice(&tag.to_be_bytes());
    buf
}

fn ata_request(major: u16, minor: u8, cmdstat: u8, lba: u64, scnt: u8, tag: u32) -> Vec<u8> {
    let payload = if cmdstat == 0x30 || cmdstat == 0x34 {
        scnt as usize * SECTOR_SIZE
    } else {
        0
    };
    let mut buf = request_header(major, minor, cmd::ATA, tag, ATA_DATA_OFF + payload);
    buf[ATA_OFF_CMDSTAT] = cmdstat;
    buf[ATA_OFF_SCNT] = scnt;
    for (i, b) in lba.to_le_bytes().iter().take(6).enumerate() {
        buf[ATA_OFF_LBA + i] = *b;
    }
    buf
}

fn cfg_request(major: u16, minor: u8, ccmd: u8, blob: &[u8], tag: u32) -> Vec<u8> {
    let mut buf = request_header(major, minor, cmd::CFG, tag, CFG_DATA_OFF + blob.len());
    buf[CFG_OFF_CCMD] = ccmd;
    buf[CFG_OFF_CSLEN..CFG_OFF_CSLEN + 2].copy_from_slice(&(blob.len() as u16).to_be_bytes());
    buf[CFG_DATA_OFF..CFG_DATA_OFF + blob.len()].copy_from_slice(blob);
    buf
}

fn tree_request(
    major: u16,
    minor: u8,
    command: u8,
    tid: u64,
    nid: u64,
    len: u64,
    payload: &[u8],
    tag: u32,
) -> Vec<u8> {
    let mut buf = request_header(major, minor, command, tag, TREE_DATA_OFF + payload.len());
    buf[TREE_OFF_TID..TREE_OFF_TID + 8].copy_from_slice(&tid.to_le_bytes());
    buf[TREE_OFF_NID..TREE_OFF_NID + 8].copy_from_slice(&nid.to_le_bytes());
    buf[TREE_OFF_LEN..TREE_OFF_LEN + 8].copy_from_slice(&len.to_le_bytes());
    buf[TREE_DATA_OFF..TREE_DATA_OFF + payload.len()].copy_from_slice(payload);
    buf
}

fn tag_of(frame: &[u8]) -> u32 {
    u32::from_be_bytes(frame[OFF_TAG..OFF_TAG + 4].try_into().unwrap())
}

fn tree_err_of(frame: &[u8]) -> i32 {
    i32::from_le_bytes(frame[TREE_OFF_ERR..TREE_OFF_ERR + 4].try_into().unwrap())
}

/// Undo the ATA byte-pair swap of an identify string field.
fn unswap(words: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len());
    for pair in words.chunks_exact(2) {
        out.push(pair[1]);
        out.push(pair[0]);
    }
    out
}

#[test]
fn add_announces_then_identify_reports_capacity() {
    let r = rig(1500);
    r.service
        .add_device(1, 2, IFNAME, Box::new(InstantDev(2048)), "/dev/loop0", "7:0".into())
        .unwrap();

    // announcement broadcast goes out first
    r.wait_for_sent(1);
    let announce = r.sent_frame(0);
    assert_eq!(&announce[OFF_DST..OFF_DST + 6], &BCAST_MAC);
    assert_eq!(&announce[OFF_SRC..OFF_SRC + 6], &MAC);
    assert_eq!(announce[OFF_CMD], cmd::CFG);
    assert_eq!(
        u16::from_be_bytes([announce[OFF_MAJOR], announce[OFF_MAJOR + 1]]),
        1
    );
    assert_eq!(announce[OFF_MINOR], 2);
    assert_eq!(
        u16::from_be_bytes([announce[CFG_OFF_FWVER], announce[CFG_OFF_FWVER + 1]]),
        0x0002
    );

    assert!(r.service.push_inbound(IFNAME, &ata_request(1, 2, 0xEC, 0, 1, 77)));
    r.wait_for_sent(2);

    let reply = r.sent_frame(1);
    assert_eq!(&reply[OFF_DST..OFF_DST + 6], &INITIATOR);
    assert_eq!(&reply[OFF_SRC..OFF_SRC + 6], &MAC);
    assert_ne!(reply[OFF_VERFL] & AOEFL_RSP, 0);
    assert_eq!(tag_of(&reply), 77);
    assert_eq!(reply.len(), ATA_DATA_OFF + 512);
    assert_eq!(reply[ATA_OFF_CMDSTAT], ata_status::DRDY);

    let id = &reply[ATA_DATA_OFF..];
    let model = unswap(&id[27 * 2..47 * 2]);
    let mut expected = b"EtherDrive(R) kvblade".to_vec();
    expected.resize(40, b' ');
    assert_eq!(model, expected);

    let lba28 = u32::from_le_bytes(id[60 * 2..60 * 2 + 4].try_into().unwrap());
    assert_eq!(lba28, 2048);
    let mut lba48 = [0u8; 8];
    lba48[..6].copy_from_slice(&id[100 * 2..100 * 2 + 6]);
    assert_eq!(u64::from_le_bytes(lba48), 2048);

    r.service.shutdown();
}

#[test]
fn out_of_range_read_replies_idnf() {
    let r = rig(1500);
    r.service
        .add_device(3, 0, IFNAME, Box::new(InstantDev(100)), "/dev/loop0", "7:0".into())
        .unwrap();
    r.wait_for_sent(1); // announcement

    r.service.push_inbound(IFNAME, &ata_request(3, 0, 0x20, 95, 10, 5));
    r.wait_for_sent(2);

    let reply = r.sent_frame(1);
    assert_eq!(reply[ATA_OFF_CMDSTAT], ata_status::ERR);
    assert_eq!(reply[ATA_OFF_ERRFEAT], ata_error::IDNF);
    assert_eq!(reply.len(), ETH_ZLEN);

    r.service.shutdown();
}

#[test]
fn slot_exhaustion_drops_the_seventeenth() {
    let r = rig(1500);
    let parked = Arc::new(Mutex::new(Vec::new()));
    r.service
        .add_device(
            1,
            0,
            IFNAME,
            Box::new(StallDev {
                sectors: 1 << 20,
                parked: parked.clone(),
            }),
            "/dev/slow0",
            "7:0".into(),
        )
        .unwrap();
    r.wait_for_sent(1); // announcement

    for tag in 0..17u32 {
        r.service
            .push_inbound(IFNAME, &ata_request(1, 0, 0x24, tag as u64, 1, tag));
    }

    // the first 16 occupy every slot; the 17th is dropped silently
    assert!(wait_until(|| parked.lock().unwrap().len() == 16));
    let target = r.service.target(1, 0, IFNAME).unwrap();
    assert_eq!(target.busy(), 16);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(r.sent_count(), 1);

    assert_eq!(release_all(&parked), 16);
    r.wait_for_sent(1 + 16);
    assert!(wait_until(|| target.busy() == 0));

    // retransmitting the dropped request now succeeds
    r.service.push_inbound(IFNAME, &ata_request(1, 0, 0x24, 16, 1, 99));
    assert!(wait_until(|| release_all(&parked) == 1));
    r.wait_for_sent(1 + 17);
    assert_eq!(tag_of(&r.sent_frame(17)), 99);

    r.service.shutdown();
}

#[test]
fn cfg_set_conflict_keeps_stored_blob() {
    let r = rig(1500);
    r.service
        .add_device(2, 1, IFNAME, Box::new(InstantDev(64)), "/dev/loop0", "7:0".into())
        .unwrap();
    r.wait_for_sent(1);

    // FSET "A"
    r.service
        .push_inbound(IFNAME, &cfg_request(2, 1, CfgCmd::ForceSet as u8, b"A", 1));
    r.wait_for_sent(2);
    assert_eq!(r.sent_frame(1)[OFF_VERFL] & AOEFL_ERR, 0);

    // SET "B" conflicts
    r.service
        .push_inbound(IFNAME, &cfg_request(2, 1, CfgCmd::Set as u8, b"B", 2));
    r.wait_for_sent(3);
    let conflict = r.sent_frame(2);
    assert_ne!(conflict[OFF_VERFL] & AOEFL_ERR, 0);
    assert_eq!(conflict[OFF_ERR], aoe_err::CFG);

    // READ still sees "A"
    r.service
        .push_inbound(IFNAME, &cfg_request(2, 1, CfgCmd::Read as u8, b"", 3));
    r.wait_for_sent(4);
    let read = r.sent_frame(3);
    let cslen = u16::from_be_bytes([read[CFG_OFF_CSLEN], read[CFG_OFF_CSLEN + 1]]) as usize;
    assert_eq!(&read[CFG_DATA_OFF..CFG_DATA_OFF + cslen], b"A");

    // FSET "B" forces the change; READ confirms
    r.service
        .push_inbound(IFNAME, &cfg_request(2, 1, CfgCmd::ForceSet as u8, b"B", 4));
    r.service
        .push_inbound(IFNAME, &cfg_request(2, 1, CfgCmd::Read as u8, b"", 5));
    r.wait_for_sent(6);
    let read = r.sent_frame(5);
    let cslen = u16::from_be_bytes([read[CFG_OFF_CSLEN], read[CFG_OFF_CSLEN + 1]]) as usize;
    assert_eq!(&read[CFG_DATA_OFF..CFG_DATA_OFF + cslen], b"B");

    r.service.shutdown();
}

#[test]
fn tree_commands_round_trip_through_the_pool() {
    // jumbo MTU so a 1 KiB node payload fits in one frame
    let r = rig(9000);
    r.service
        .add_device(5, 5, IFNAME, Box::new(InstantDev(64)), "/dev/loop0", "7:0".into())
        .unwrap();
    r.wait_for_sent(1);

    r.service
        .push_inbound(IFNAME, &tree_request(5, 5, cmd::CREATETREE, 0, 0, 0, &[], 1));
    r.wait_for_sent(2);
    let reply = r.sent_frame(1);
    assert_eq!(tree_err_of(&reply), 0);
    let tid = u64::from_le_bytes(reply[TREE_OFF_TID..TREE_OFF_TID + 8].try_into().unwrap());
    assert!(tid > 0);

    r.service
        .push_inbound(IFNAME, &tree_request(5, 5, cmd::INSERTNODE, tid, 0, 0, &[], 2));
    r.wait_for_sent(3);
    let reply = r.sent_frame(2);
    assert_eq!(tree_err_of(&reply), 0);
    let nid = u64::from_le_bytes(reply[TREE_OFF_NID..TREE_OFF_NID + 8].try_into().unwrap());
    assert!(nid > 0);

    let payload: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
    r.service.push_inbound(
        IFNAME,
        &tree_request(5, 5, cmd::UPDATENODE, tid, nid, 1024, &payload, 3),
    );
    r.wait_for_sent(4);
    assert_eq!(tree_err_of(&r.sent_frame(3)), 0);

    r.service
        .push_inbound(IFNAME, &tree_request(5, 5, cmd::READNODE, tid, nid, 1024, &[], 4));
    r.wait_for_sent(5);
    let reply = r.sent_frame(4);
    assert_eq!(tree_err_of(&reply), 0);
    assert_eq!(reply.len(), TREE_DATA_OFF + 1024);
    assert_eq!(&reply[TREE_DATA_OFF..], payload.as_slice());

    r.service.shutdown();
}

#[test]
fn wildcard_address_reaches_every_blade_on_the_interface() {
    let r = rig(1500);
    r.service
        .add_device(1, 0, IFNAME, Box::new(InstantDev(64)), "/dev/a", "7:0".into())
        .unwrap();
    r.service
        .add_device(1, 1, IFNAME, Box::new(InstantDev(64)), "/dev/b", "7:1".into())
        .unwrap();
    r.wait_for_sent(2); // two announcements

    r.service
        .push_inbound(IFNAME, &cfg_request(SHELF_BCAST, SLOT_BCAST, 0, b"", 9));
    r.wait_for_sent(4);

    let minors: Vec<u8> = (2..4).map(|i| r.sent_frame(i)[OFF_MINOR]).collect();
    assert!(minors.contains(&0) && minors.contains(&1));

    r.service.shutdown();
}

#[test]
fn shutdown_waits_for_parked_write() {
    let r = rig(1500);
    let parked = Arc::new(Mutex::new(Vec::new()));
    r.service
        .add_device(
            4,
            0,
            IFNAME,
            Box::new(StallDev {
                sectors: 1024,
                parked: parked.clone(),
            }),
            "/dev/slow0",
            "7:0".into(),
        )
        .unwrap();
    r.wait_for_sent(1);

    r.service.push_inbound(IFNAME, &ata_request(4, 0, 0x34, 10, 1, 21));
    assert!(wait_until(|| parked.lock().unwrap().len() == 1));

    let sent = r.sent.clone();
    let done = Arc::new(Mutex::new(false));
    let done2 = done.clone();
    let service = r.service;
    let handle = thread::spawn(move || {
        service.shutdown();
        *done2.lock().unwrap() = true;
    });

    // teardown must stall while the write is parked
    thread::sleep(Duration::from_millis(300));
    assert!(!*done.lock().unwrap());

    release_all(&parked);
    handle.join().unwrap();
    assert!(*done.lock().unwrap());

    // the completion made it onto the wire before the worker stopped
    let frames = sent.lock().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(tag_of(&frames[1]), 21);
    assert_eq!(frames[1][ATA_OFF_CMDSTAT], ata_status::DRDY);
}
