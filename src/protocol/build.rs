//! In-place construction of response frames.
//!
//! Responses start life as a mirror of the request: the whole inbound
//! frame is copied into a fresh MTU-sized buffer, the MAC addresses are
//! swapped, the response flag is set, and the target's own address is
//! written. Handlers then edit the sub-header in place and trim.

use super::types::*;
use crate::frame::Frame;
use crate::net::NetIf;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

/// Mirror a request into a response frame addressed back at the sender.
pub fn make_response(req: &Frame, major: u16, minor: u8) -> Frame {
    let iface = req.iface().clone();
    let cap = ETH_HLEN + iface.mtu();
    let mut rf = Frame::response(iface.clone(), cap);

    let n = req.len().min(rf.len());
    rf.bytes_mut()[..n].copy_from_slice(&req.bytes()[..n]);

    let buf = rf.bytes_mut();
    let src: [u8; 6] = buf[OFF_SRC..OFF_SRC + 6].try_into().unwrap();
    buf[OFF_DST..OFF_DST + 6].copy_from_slice(&src);
    buf[OFF_SRC..OFF_SRC + 6].copy_from_slice(&iface.mac());
    buf[OFF_ETHERTYPE..OFF_ETHERTYPE + 2].copy_from_slice(&AOE_ETHERTYPE.to_be_bytes());
    buf[OFF_VERFL] = AOE_HVER | AOEFL_RSP;
    buf[OFF_ERR] = 0;
    buf[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&major.to_be_bytes());
    buf[OFF_MINOR] = minor;

    rf
}

/// Unsolicited CFG broadcast advertising a target.
pub fn announce(
    iface: &Arc<dyn NetIf>,
    major: u16,
    minor: u8,
    config: &[u8],
) -> Frame {
    let len = CFG_DATA_OFF + config.len();
    let mut f = Frame::response(iface.clone(), len);

    let mtu = iface.mtu();
    let buf = f.bytes_mut();
    buf[OFF_DST..OFF_DST + 6].copy_from_slice(&BCAST_MAC);
    buf[OFF_SRC..OFF_SRC + 6].copy_from_slice(&iface.mac());
    buf[OFF_ETHERTYPE..OFF_ETHERTYPE + 2].copy_from_slice(&AOE_ETHERTYPE.to_be_bytes());
    buf[OFF_VERFL] = AOE_HVER | AOEFL_RSP;
    buf[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&major.to_be_bytes());
    buf[OFF_MINOR] = minor;
    buf[OFF_CMD] = cmd::CFG;

    set_cfg_reply_fields(buf, mtu);
    if !config.is_empty() {
        set_cfg_cslen(buf, config.len());
        buf[CFG_DATA_OFF..CFG_DATA_OFF + config.len()].copy_from_slice(config);
    }

    f
}

/// Flag a response as an error and record the AoE error code.
pub fn set_error(buf: &mut [u8], code: u8) {
    buf[OFF_VERFL] |= AOEFL_ERR;
    buf[OFF_ERR] = code;
}

/// Fill the CFG reply fields every CFG response carries: buffer count,
/// firmware version, sectors per frame, and the version nibble.
pub fn set_cfg_reply_fields(buf: &mut [u8], mtu: usize) {
    buf[CFG_OFF_BUFCNT..CFG_OFF_BUFCNT + 2].copy_from_slice(&(NSLOTS as u16).to_be_bytes());
    buf[CFG_OFF_FWVER..CFG_OFF_FWVER + 2].copy_from_slice(&FWVER.to_be_bytes());
    buf[CFG_OFF_SCNT] = max_sectors(mtu);
    buf[CFG_OFF_CCMD] = AOE_HVER;
}

pub fn set_cfg_cslen(buf: &mut [u8], cslen: usize) {
    buf[CFG_OFF_CSLEN..CFG_OFF_CSLEN + 2].copy_from_slice(&(cslen as u16).to_be_bytes());
}

/// Rewrite the ATA result registers on a response.
pub fn set_ata_result(buf: &mut [u8], cmdstat: u8, errfeat: u8) {
    buf[ATA_OFF_CMDSTAT] = cmdstat;
    buf[ATA_OFF_ERRFEAT] = errfeat;
}

pub fn set_ata_scnt(buf: &mut [u8], scnt: u8) {
    buf[ATA_OFF_SCNT] = scnt;
}

// TREE sub-header setters

pub fn set_tree_tid(buf: &mut [u8], tid: u64) {
    LittleEndian::write_u64(&mut buf[TREE_OFF_TID..TREE_OFF_TID + 8], tid);
}

pub fn set_tree_nid(buf: &mut [u8], nid: u64) {
    LittleEndian::write_u64(&mut buf[TREE_OFF_NID..TREE_OFF_NID + 8], nid);
}

pub fn set_tree_len(buf: &mut [u8], len: u64) {
    LittleEndian::write_u64(&mut buf[TREE_OFF_LEN..TREE_OFF_LEN + 8], len);
}

pub fn set_tree_err(buf: &mut [u8], err: i32) {
    LittleEndian::write_i32(&mut buf[TREE_OFF_ERR..TREE_OFF_ERR + 4], err);
}
