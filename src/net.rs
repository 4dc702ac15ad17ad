//! Network interfaces.
//!
//! The server talks to the wire through the [`NetIf`] trait so the frame
//! path can be exercised against mock interfaces in tests. The production
//! implementation rides on pnet's datalink channels.

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender};
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Fallback when the MTU cannot be discovered.
pub const DEFAULT_MTU: usize = 1500;

/// Errors opening an interface
#[derive(Debug, Error)]
pub enum NetError {
    #[error("interface not found: {0}")]
    NotFound(String),

    #[error("unsupported channel type on {0}")]
    ChannelType(String),

    #[error("failed to open channel: {0}")]
    Io(#[from] io::Error),
}

/// A raw Ethernet interface: identity plus a transmit path.
pub trait NetIf: Send + Sync {
    fn name(&self) -> &str;
    fn mac(&self) -> [u8; 6];
    fn mtu(&self) -> usize;
    fn transmit(&self, frame: &[u8]) -> io::Result<()>;
}

/// pnet-backed interface. Receive is handled by the rx pump which owns
/// the channel's receiver half; transmit is serialized by a mutex.
pub struct PnetIf {
    name: String,
    mac: [u8; 6],
    mtu: usize,
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl PnetIf {
    /// Open an interface by name. Returns the interface handle and the
    /// receiver half for the caller to pump. The receive side is given a
    /// short read timeout so the pump can notice shutdown.
    pub fn open(name: &str) -> Result<(PnetIf, Box<dyn DataLinkReceiver>), NetError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| NetError::NotFound(name.to_string()))?;

        let config = datalink::Config {
            read_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let (tx, rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(NetError::ChannelType(name.to_string())),
            Err(e) => return Err(NetError::Io(e)),
        };

        let mac = interface.mac.map(|m| m.octets()).unwrap_or([0; 6]);

        Ok((
            PnetIf {
                name: name.to_string(),
                mac,
                mtu: interface_mtu(name),
                tx: Mutex::new(tx),
            },
            rx,
        ))
    }
}

impl NetIf for PnetIf {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        let mut tx = self.tx.lock().unwrap();
        match tx.send_to(frame, None) {
            Some(res) => res,
            None => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "transmit buffer unavailable",
            )),
        }
    }
}

/// Interface MTU from sysfs, falling back to the Ethernet default.
fn interface_mtu(name: &str) -> usize {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MTU)
}
