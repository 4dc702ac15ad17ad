//! ATA engine.
//!
//! IDENTIFY, FLUSH and error cases complete inline on the service
//! worker. Sector reads and writes park the response frame in a request
//! slot and submit a [`SectorIo`] whose buffer is the frame's own
//! payload region; the completion rewrites the result registers from the
//! backend's context and hands the frame to the egress queue. When all
//! 16 slots are in flight the request is dropped and the initiator
//! retransmits.

use crate::frame::Frame;
use crate::protocol::types::*;
use crate::protocol::{ata as identify, build, parse};
use crate::server::registry::Target;
use crate::server::Egress;
use crate::storage::{IoDir, IoDone, SectorIo};
use std::sync::Arc;

/// Dispatch an ATA request mirrored into `rf`. Returns the frame when
/// the response is synchronous; None when it was parked in a slot or
/// dropped.
pub fn dispatch(egress: &Arc<Egress>, target: &Arc<Target>, mut rf: Frame) -> Option<Frame> {
    let cmdstat = parse::ata_cmdstat(rf.bytes());
    let scnt = parse::ata_scnt(rf.bytes());
    let lba = parse::ata_lba(rf.bytes());

    let (dir, lba) = match AtaCmd::try_from(cmdstat) {
        Ok(AtaCmd::PioRead) => (IoDir::Read, lba & LBA28_MAX),
        Ok(AtaCmd::PioReadExt) => (IoDir::Read, lba & LBA48_MASK),
        Ok(AtaCmd::PioWrite) => (IoDir::Write, lba & LBA28_MAX),
        Ok(AtaCmd::PioWriteExt) => (IoDir::Write, lba & LBA48_MASK),
        Ok(AtaCmd::Identify) => {
            let buf = rf.bytes_mut();
            let model = target.model();
            let serial = target.serial();
            identify::identify(&model, &serial, target.sectors(), &mut buf[ATA_DATA_OFF..]);
            build::set_ata_result(buf, ata_status::DRDY, 0);
            rf.trim(ATA_DATA_OFF + 512);
            return Some(rf);
        }
        Ok(AtaCmd::Flush) | Ok(AtaCmd::FlushExt) => {
            build::set_ata_result(rf.bytes_mut(), ata_status::DRDY, 0);
            rf.trim(ATA_DATA_OFF);
            return Some(rf);
        }
        Err(other) => {
            log::warn!("unknown ATA command 0x{other:02X}");
            build::set_ata_result(rf.bytes_mut(), ata_status::ERR, ata_error::ABRT);
            rf.trim(ATA_DATA_OFF);
            return Some(rf);
        }
    };

    if lba + u64::from(scnt) > target.sectors() {
        log::warn!(
            "sector I/O out of range on {}.{}: lba {} ({} sectors), capacity {}",
            target.major,
            target.minor,
            lba,
            scnt,
            target.sectors()
        );
        build::set_ata_result(rf.bytes_mut(), ata_status::ERR, ata_error::IDNF);
        rf.trim(ATA_DATA_OFF);
        return Some(rf);
    }

    let nbytes = scnt as usize * SECTOR_SIZE;
    if ATA_DATA_OFF + nbytes > rf.len() {
        // more sectors than the advertised per-frame limit: drop
        return None;
    }

    let Some(slot) = target.slots.alloc() else {
        // all 16 slots in flight; the initiator will retransmit
        return None;
    };

    target.inc_busy();
    target.submit(SectorIo {
        dir,
        lba,
        off: ATA_DATA_OFF,
        len: nbytes,
        frame: rf,
        done: completion(egress.clone(), target.clone(), slot, dir),
    });
    None
}

/// Completion shared by reads and writes: runs in the backend's context
/// and touches only the slot, the busy count, and the egress queue.
fn completion(egress: Arc<Egress>, target: Arc<Target>, slot: usize, dir: IoDir) -> IoDone {
    Box::new(move |mut frame: Frame, result| {
        let len = match result {
            Ok(n) => {
                let buf = frame.bytes_mut();
                build::set_ata_scnt(buf, 0);
                build::set_ata_result(buf, ata_status::DRDY, 0);
                ATA_DATA_OFF + if dir == IoDir::Read { n } else { 0 }
            }
            Err(e) => {
                log::error!("I/O error on {}.{}: {}", target.major, target.minor, e);
                build::set_ata_result(
                    frame.bytes_mut(),
                    ata_status::ERR | ata_status::DF,
                    ata_error::UNC | ata_error::ABRT,
                );
                ATA_DATA_OFF
            }
        };
        frame.trim(len);
        target.slots.release(slot);
        target.dec_busy();
        egress.send(frame);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetIf;
    use crate::storage::{BlockDev, StorageError};
    use std::io;
    use std::sync::Mutex;

    struct FakeIf;

    impl NetIf for FakeIf {
        fn name(&self) -> &str {
            "fake0"
        }
        fn mac(&self) -> [u8; 6] {
            [0x02, 0, 0, 0, 0, 0x01]
        }
        fn mtu(&self) -> usize {
            1500
        }
        fn transmit(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    /// Completes everything inline; writes record their LBA and payload.
    struct EchoDev {
        sectors: u64,
        fail: bool,
        writes: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl EchoDev {
        fn new(sectors: u64) -> EchoDev {
            EchoDev {
                sectors,
                fail: false,
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl BlockDev for EchoDev {
        fn sectors(&self) -> u64 {
            self.sectors
        }
        fn submit(&self, io: SectorIo) {
            if self.fail {
                (io.done)(
                    io.frame,
                    Err(StorageError::Io(io::Error::other("bad sector"))),
                );
                return;
            }
            if io.dir == IoDir::Write {
                self.writes
                    .lock()
                    .unwrap()
                    .push((io.lba, io.frame.bytes()[io.off..io.off + io.len].to_vec()));
            }
            let len = io.len;
            (io.done)(io.frame, Ok(len));
        }
    }

    fn make_target(dev: EchoDev) -> Arc<Target> {
        Arc::new(Target::new(
            1,
            2,
            Arc::new(FakeIf),
            Box::new(dev),
            "/dev/null",
            "0:0".to_string(),
            DEFAULT_MODEL,
            DEFAULT_SERIAL,
        ))
    }

    fn ata_frame(cmdstat: u8, lba: u64, scnt: u8) -> Frame {
        let mut rf = Frame::response(Arc::new(FakeIf), ETH_HLEN + 1500);
        let buf = rf.bytes_mut();
        buf[OFF_VERFL] = AOE_HVER | AOEFL_RSP;
        buf[OFF_CMD] = cmd::ATA;
        buf[ATA_OFF_CMDSTAT] = cmdstat;
        buf[ATA_OFF_SCNT] = scnt;
        for (i, b) in lba.to_le_bytes().iter().take(6).enumerate() {
            buf[ATA_OFF_LBA + i] = *b;
        }
        rf
    }

    #[test]
    fn identify_replies_inline() {
        let egress = Arc::new(Egress::new());
        let t = make_target(EchoDev::new(2048));

        let rf = dispatch(&egress, &t, ata_frame(0xEC, 0, 1)).expect("sync reply");
        assert_eq!(rf.len(), ATA_DATA_OFF + 512);
        assert_eq!(rf.bytes()[ATA_OFF_CMDSTAT], ata_status::DRDY);

        // word 60 of the identify payload carries the 28-bit capacity
        let w60 = ATA_DATA_OFF + 60 * 2;
        let lba28 = u16::from_le_bytes([rf.bytes()[w60], rf.bytes()[w60 + 1]]);
        assert_eq!(lba28, 2048);
        assert_eq!(t.busy(), 0);
    }

    #[test]
    fn out_of_range_read_gets_idnf() {
        let egress = Arc::new(Egress::new());
        let t = make_target(EchoDev::new(100));

        let rf = dispatch(&egress, &t, ata_frame(0x20, 95, 10)).expect("sync reply");
        assert_eq!(rf.bytes()[ATA_OFF_CMDSTAT], ata_status::ERR);
        assert_eq!(rf.bytes()[ATA_OFF_ERRFEAT], ata_error::IDNF);
        assert_eq!(rf.len(), ETH_ZLEN);
    }

    #[test]
    fn read_completes_through_the_egress_queue() {
        let egress = Arc::new(Egress::new());
        let t = make_target(EchoDev::new(100));

        assert!(dispatch(&egress, &t, ata_frame(0x24, 10, 2)).is_none());
        // EchoDev completed inline, so the reply is queued already
        let rf = egress.pop().expect("completed frame");
        assert_eq!(rf.bytes()[ATA_OFF_CMDSTAT], ata_status::DRDY);
        assert_eq!(rf.bytes()[ATA_OFF_SCNT], 0);
        assert_eq!(rf.len(), ATA_DATA_OFF + 2 * SECTOR_SIZE);
        assert_eq!(t.busy(), 0);
        assert_eq!(t.slots.in_flight(), 0);
    }

    #[test]
    fn write_reply_has_no_payload() {
        let egress = Arc::new(Egress::new());
        let t = make_target(EchoDev::new(100));

        let mut rf = ata_frame(0x34, 5, 1);
        rf.bytes_mut()[ATA_DATA_OFF..ATA_DATA_OFF + SECTOR_SIZE].fill(0x77);
        assert!(dispatch(&egress, &t, rf).is_none());

        let reply = egress.pop().expect("completed frame");
        assert_eq!(reply.bytes()[ATA_OFF_CMDSTAT], ata_status::DRDY);
        assert_eq!(reply.len(), ETH_ZLEN);
    }

    #[test]
    fn backend_failure_reports_uncorrectable() {
        let egress = Arc::new(Egress::new());
        let mut dev = EchoDev::new(100);
        dev.fail = true;
        let t = make_target(dev);

        assert!(dispatch(&egress, &t, ata_frame(0x20, 0, 1)).is_none());
        let rf = egress.pop().expect("completed frame");
        assert_eq!(rf.bytes()[ATA_OFF_CMDSTAT], ata_status::ERR | ata_status::DF);
        assert_eq!(rf.bytes()[ATA_OFF_ERRFEAT], ata_error::UNC | ata_error::ABRT);
        assert_eq!(t.busy(), 0);
    }

    #[test]
    fn unknown_command_aborts() {
        let egress = Arc::new(Egress::new());
        let t = make_target(EchoDev::new(100));

        let rf = dispatch(&egress, &t, ata_frame(0xA1, 0, 0)).expect("sync reply");
        assert_eq!(rf.bytes()[ATA_OFF_CMDSTAT], ata_status::ERR);
        assert_eq!(rf.bytes()[ATA_OFF_ERRFEAT], ata_error::ABRT);
    }

    #[test]
    fn lba28_command_masks_high_bits() {
        let egress = Arc::new(Egress::new());
        let dev = EchoDev::new(100);
        let writes = dev.writes.clone();
        let t = make_target(dev);

        // high bits beyond 28 are masked off, landing back in range
        let lba = (1u64 << 40) | 3;
        assert!(dispatch(&egress, &t, ata_frame(0x30, lba, 1)).is_none());
        assert!(egress.pop().is_some());
        assert_eq!(writes.lock().unwrap()[0].0, 3);
    }
}
