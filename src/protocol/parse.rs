//! Field readers over raw AoE frames.
//!
//! Requests are handled in place: the classifier validates the header
//! once with [`request`], then the engines read sub-header fields through
//! the accessors below. Nothing here allocates.

use super::types::*;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Frame rejection reasons. All of these end in a silent drop; the enum
/// exists so tests and debug logs can tell them apart.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("runt frame: {0} bytes")]
    Runt(usize),

    #[error("not AoE: ethertype 0x{0:04X}")]
    NotAoe(u16),

    #[error("unsupported AoE version {0}")]
    BadVersion(u8),

    #[error("response flag set on a request")]
    IsResponse,

    #[error("truncated sub-header for command 0x{cmd:02X}: {have} < {need} bytes")]
    Truncated { cmd: u8, need: usize, have: usize },
}

/// Addressing fields of a validated request frame.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub major: u16,
    pub minor: u8,
    pub cmd: u8,
}

/// Validate an inbound frame and extract its addressing.
///
/// Checks the EtherType, version nibble, direction flag, and that the
/// frame is long enough for the sub-header its command implies. Unknown
/// commands pass; the classifier drops them per target.
pub fn request(buf: &[u8]) -> Result<Request, ParseError> {
    if buf.len() < AOE_HDR_LEN {
        return Err(ParseError::Runt(buf.len()));
    }

    let ethertype = u16::from_be_bytes([buf[OFF_ETHERTYPE], buf[OFF_ETHERTYPE + 1]]);
    if ethertype != AOE_ETHERTYPE {
        return Err(ParseError::NotAoe(ethertype));
    }

    let verfl = buf[OFF_VERFL];
    if verfl >> 4 != AOE_HVER >> 4 {
        return Err(ParseError::BadVersion(verfl >> 4));
    }
    if verfl & AOEFL_RSP != 0 {
        return Err(ParseError::IsResponse);
    }

    let cmd = buf[OFF_CMD];
    let need = match cmd {
        cmd::ATA => ATA_DATA_OFF,
        cmd::CFG => CFG_DATA_OFF,
        c if is_tree_cmd(c) => TREE_DATA_OFF,
        _ => AOE_HDR_LEN,
    };
    if buf.len() < need {
        return Err(ParseError::Truncated {
            cmd,
            need,
            have: buf.len(),
        });
    }

    Ok(Request {
        major: u16::from_be_bytes([buf[OFF_MAJOR], buf[OFF_MAJOR + 1]]),
        minor: buf[OFF_MINOR],
        cmd,
    })
}

pub fn src_mac(buf: &[u8]) -> [u8; 6] {
    buf[OFF_SRC..OFF_SRC + 6].try_into().unwrap()
}

// CFG sub-header

pub fn cfg_ccmd(buf: &[u8]) -> u8 {
    buf[CFG_OFF_CCMD] & 0x0F
}

pub fn cfg_cslen(buf: &[u8]) -> usize {
    u16::from_be_bytes([buf[CFG_OFF_CSLEN], buf[CFG_OFF_CSLEN + 1]]) as usize
}

// ATA sub-header

pub fn ata_scnt(buf: &[u8]) -> u8 {
    buf[ATA_OFF_SCNT]
}

pub fn ata_cmdstat(buf: &[u8]) -> u8 {
    buf[ATA_OFF_CMDSTAT]
}

/// 48-bit little-endian LBA.
pub fn ata_lba(buf: &[u8]) -> u64 {
    let mut lba = 0u64;
    for i in (0..6).rev() {
        lba = (lba << 8) | u64::from(buf[ATA_OFF_LBA + i]);
    }
    lba
}

// TREE sub-header

pub fn tree_tid(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[TREE_OFF_TID..])
}

pub fn tree_nid(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[TREE_OFF_NID..])
}

pub fn tree_off(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[TREE_OFF_OFFSET..])
}

pub fn tree_len(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[TREE_OFF_LEN..])
}

pub fn tree_err(buf: &[u8]) -> i32 {
    LittleEndian::read_i32(&buf[TREE_OFF_ERR..])
}
