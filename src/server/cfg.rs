//! CFG sub-command responder.
//!
//! Operates on the mirrored response frame in place. The sub-commands
//! chain: a passing TEST behaves like PTEST, a passing PTEST like READ,
//! and a non-conflicting SET like FSET. Mismatched tests drop silently;
//! a conflicting SET replies with `AOEERR_CFG`; an unknown sub-command
//! with `AOEERR_ARG`.

use crate::frame::Frame;
use crate::protocol::types::*;
use crate::protocol::{build, parse};
use crate::server::registry::Target;

/// Handle the CFG request mirrored into `rf`. Returns false when the
/// response must be dropped.
pub fn respond(target: &Target, rf: &mut Frame) -> bool {
    let mtu = rf.iface().mtu();
    let buf = rf.bytes_mut();

    let ccmd = parse::cfg_ccmd(buf);
    let cslen = parse::cfg_cslen(buf);
    if cslen > CONFIG_MAX || CFG_DATA_OFF + cslen > buf.len() {
        return false;
    }
    let incoming = buf[CFG_DATA_OFF..CFG_DATA_OFF + cslen].to_vec();

    build::set_cfg_reply_fields(buf, mtu);

    let stored = target.config();
    let len = match CfgCmd::try_from(ccmd) {
        Ok(CfgCmd::Test) if stored.len() != cslen => return false,
        Ok(CfgCmd::Test) | Ok(CfgCmd::PrefixTest) => {
            if cslen > stored.len() || stored[..cslen] != incoming[..] {
                return false;
            }
            read_reply(buf, &stored)
        }
        Ok(CfgCmd::Read) => read_reply(buf, &stored),
        Ok(CfgCmd::Set) if !stored.is_empty() && stored != incoming => {
            build::set_error(buf, aoe_err::CFG);
            AOE_HDR_LEN
        }
        Ok(CfgCmd::Set) | Ok(CfgCmd::ForceSet) => {
            target.set_config(&incoming);
            // the new blob is already in place, mirrored from the request
            build::set_cfg_cslen(buf, cslen);
            CFG_DATA_OFF + cslen
        }
        Err(_) => {
            build::set_error(buf, aoe_err::ARG);
            AOE_HDR_LEN
        }
    };

    rf.trim(len);
    true
}

fn read_reply(buf: &mut [u8], stored: &[u8]) -> usize {
    build::set_cfg_cslen(buf, stored.len());
    buf[CFG_DATA_OFF..CFG_DATA_OFF + stored.len()].copy_from_slice(stored);
    CFG_DATA_OFF + stored.len()
}
