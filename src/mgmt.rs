//! Line-based management surface.
//!
//! Commands are space-separated tokens, one per line:
//!
//! ```text
//! add <major> <minor> <interface> <path>
//! del <major> <minor> <interface>
//! get <major> <minor> <interface> <field>      field: scnt bdev bpath model sn
//! set <major> <minor> <interface> <field> <v>  field: model sn
//! list
//! ```
//!
//! Results are `Ok(text)` or a negated errno, mirroring what the kernel
//! attribute store/show calls would have returned. `scst` is accepted as
//! an alias of `scnt`; the historical interface registered the sector
//! count attribute under that spelling.

use crate::server::Service;

/// Parse and execute one management line.
pub fn dispatch(service: &Service, line: &str) -> Result<String, i32> {
    let argv: Vec<&str> = line.split_whitespace().collect();

    match argv.as_slice() {
        ["add", major, minor, ifname, path] => {
            let (major, minor) = address(major, minor)?;
            service
                .add(major, minor, ifname, path)
                .map(|()| String::new())
                .map_err(|e| {
                    log::error!("add failed: {e}");
                    e.errno()
                })
        }
        ["del", major, minor, ifname] => {
            let (major, minor) = address(major, minor)?;
            service
                .del(major, minor, ifname)
                .map(|()| String::new())
                .map_err(|e| {
                    log::error!("del failed: {e}");
                    e.errno()
                })
        }
        ["get", major, minor, ifname, field] => {
            let (major, minor) = address(major, minor)?;
            let target = service
                .target(major, minor, ifname)
                .ok_or(-libc::ENOENT)?;
            match *field {
                "scnt" | "scst" => Ok(target.sectors().to_string()),
                "bdev" => Ok(target.bdev_id.clone()),
                "bpath" => Ok(target.path.clone()),
                "model" => Ok(field_text(&target.model())),
                "sn" => Ok(field_text(&target.serial())),
                _ => Err(-libc::EINVAL),
            }
        }
        ["set", major, minor, ifname, field, value @ ..] if !value.is_empty() => {
            let (major, minor) = address(major, minor)?;
            let target = service
                .target(major, minor, ifname)
                .ok_or(-libc::ENOENT)?;
            let value = value.join(" ");
            match *field {
                "model" => {
                    target.set_model(&value);
                    Ok(String::new())
                }
                "sn" => {
                    target.set_serial(&value);
                    Ok(String::new())
                }
                _ => Err(-libc::EINVAL),
            }
        }
        ["list"] => {
            let targets: Vec<_> = service
                .targets()
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "major": t.major,
                        "minor": t.minor,
                        "interface": t.ifname(),
                        "path": t.path,
                        "scnt": t.sectors(),
                        "busy": t.busy(),
                    })
                })
                .collect();
            Ok(serde_json::Value::Array(targets).to_string())
        }
        _ => Err(-libc::EINVAL),
    }
}

fn address(major: &str, minor: &str) -> Result<(u16, u8), i32> {
    let major = number(major).ok_or(-libc::EINVAL)?;
    let minor = number(minor).ok_or(-libc::EINVAL)?;
    let major = u16::try_from(major).map_err(|_| -libc::EINVAL)?;
    let minor = u8::try_from(minor).map_err(|_| -libc::EINVAL)?;
    Ok((major, minor))
}

/// Decimal or 0x-prefixed hex.
fn number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Render a fixed-width identity field, trailing padding removed.
fn field_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}
