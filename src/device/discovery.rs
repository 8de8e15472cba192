//! Device discovery over adb.
//!
//! Lists serials reported by `adb devices`, optionally connecting to
//! explicit `host:port` endpoints first so networked devices show up too.

use std::time::Duration;
use tracing::{info, warn};

use super::{DeviceResult, run_adb};
use crate::config;

/// Connect to an explicit remote endpoint (`host:port`).
///
/// Returns true when adb reports the device as connected (including
/// "already connected").
pub fn connect(host: &str) -> DeviceResult<bool> {
    let cfg = config::get();
    let out = run_adb(
        &cfg.adb.executable,
        &["connect", host],
        Duration::from_secs(cfg.adb.command_timeout),
    )?;
    let text = String::from_utf8_lossy(&out);
    Ok(text.contains("connected"))
}

/// List serials of all devices currently in the `device` state.
///
/// `remotes` are `host:port` endpoints to connect before listing.
pub fn discover(remotes: &[String]) -> DeviceResult<Vec<String>> {
    for host in remotes {
        match connect(host) {
            Ok(true) => info!(%host, "remote device connected"),
            Ok(false) => warn!(%host, "remote device did not connect"),
            Err(e) => warn!(%host, error = %e, "remote connect failed"),
        }
    }

    let cfg = config::get();
    let out = run_adb(
        &cfg.adb.executable,
        &["devices"],
        Duration::from_secs(cfg.adb.command_timeout),
    )?;
    let listing = String::from_utf8_lossy(&out);
    let devices = parse_device_list(&listing);
    info!(count = devices.len(), "devices discovered");
    Ok(devices)
}

/// Parse `adb devices` output into ready serials, deduplicated and sorted
fn parse_device_list(output: &str) -> Vec<String> {
    let mut devices: Vec<String> = output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            if state == "device" {
                Some(serial.to_string())
            } else {
                None
            }
        })
        .collect();
    devices.sort();
    devices.dedup();
    devices
}
