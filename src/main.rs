//! kvblade daemon.
//!
//! Loads a TOML configuration, opens the listed interfaces, exports the
//! configured blades, then serves the management surface on a Unix
//! socket until told to quit.

use anyhow::{Context, Result};
use clap::Parser;
use kvblade::tree::MemTreeStore;
use kvblade::{Config, Service};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "AoE target server with tree-node commands")]
struct Cli {
    /// Path to the TOML configuration file
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    env_logger::Builder::new()
        .filter_level(parse_log_level(&config.server.log_level))
        .init();

    log::info!("kvblade v{}", env!("CARGO_PKG_VERSION"));

    let service = Service::new(Arc::new(MemTreeStore::new()));

    for ifname in &config.server.interfaces {
        service
            .attach_interface(ifname)
            .with_context(|| format!("failed to open interface {ifname}"))?;
    }

    for target in &config.target {
        if let Err(e) = service.add(target.major, target.minor, &target.interface, &target.path) {
            log::error!(
                "add failed for {}.{}@{}: {}",
                target.major,
                target.minor,
                target.interface,
                e
            );
        }
    }

    control_loop(&service, &config.server.control_socket)
        .context("management socket error")?;

    service.shutdown();
    Ok(())
}

/// Serve management lines until a client says `quit`.
fn control_loop(service: &Service, path: &str) -> Result<()> {
    let _ = std::fs::remove_file(path);
    let listener =
        UnixListener::bind(path).with_context(|| format!("failed to bind {path}"))?;
    log::info!("management socket at {path}");

    let mut quit = false;
    while !quit {
        match listener.accept() {
            Ok((stream, _)) => {
                quit = serve_client(service, stream);
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
            }
        }
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

/// Handle one management connection. Returns true when the client asked
/// the server to quit.
fn serve_client(service: &Service, stream: UnixStream) -> bool {
    let reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            log::warn!("management connection failed: {e}");
            return false;
        }
    };
    let mut writer = stream;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.trim() == "quit" {
            let _ = writeln!(writer, "OK");
            return true;
        }

        let reply = match kvblade::mgmt::dispatch(service, &line) {
            Ok(text) if text.is_empty() => "OK".to_string(),
            Ok(text) => format!("OK {text}"),
            Err(errno) => format!("ERR {errno}"),
        };
        if writeln!(writer, "{reply}").is_err() {
            break;
        }
    }
    false
}

fn parse_log_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => {
            eprintln!("Unknown log level '{level}', defaulting to 'info'");
            log::LevelFilter::Info
        }
    }
}
