//! Device bridge: sensing and actuation over adb.
//!
//! All device traffic funnels through [`AdbBridge`], a thin subprocess shell
//! around the adb executable with a watchdog timeout (std::process has no
//! native one). [`AdbDevice`] combines the observer and actuator halves into
//! the [`DeviceIo`](crate::agent::DeviceIo) seam the step loop consumes.

pub mod actuator;
pub mod discovery;
pub mod observer;

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::agent::types::{DeviceIo, Observation};
use crate::config;
use crate::ui::{self, Viewport};

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors from the device bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device or the bridge itself is not responding; fatal to the run
    Unreachable(String),
    /// The device refused a specific action; recorded, never retried
    Rejected(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Unreachable(msg) => write!(f, "Device unreachable: {}", msg),
            DeviceError::Rejected(msg) => write!(f, "Action rejected: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Run an adb invocation with a watchdog: the child is killed once `timeout`
/// elapses. Returns raw stdout bytes on success.
pub(crate) fn run_adb(adb_path: &str, args: &[&str], timeout: Duration) -> DeviceResult<Vec<u8>> {
    debug!(?args, "adb");
    let mut child = Command::new(adb_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DeviceError::Unreachable(format!("failed to launch '{}': {}", adb_path, e)))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DeviceError::Unreachable(format!(
                        "adb {} timed out after {:?}",
                        args.first().unwrap_or(&""),
                        timeout
                    )));
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                return Err(DeviceError::Unreachable(format!(
                    "failed to wait for adb: {}",
                    e
                )));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    if !status.success() {
        return Err(DeviceError::Unreachable(format!(
            "adb {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(stdout)
}

/// Serial-bound adb access shared by the observer and the actuator
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: String,
    serial: String,
    timeout: Duration,
}

impl AdbBridge {
    /// Bridge to one device using the configured adb path and timeout
    pub fn new(serial: impl Into<String>) -> Self {
        let cfg = config::get();
        Self {
            adb_path: cfg.adb.executable.clone(),
            serial: serial.into(),
            timeout: Duration::from_secs(cfg.adb.command_timeout),
        }
    }

    pub fn with_adb_path(mut self, path: impl Into<String>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Run an adb subcommand against this device, returning raw stdout
    pub fn exec(&self, args: &[&str]) -> DeviceResult<Vec<u8>> {
        let mut full: Vec<&str> = vec!["-s", &self.serial];
        full.extend_from_slice(args);
        run_adb(&self.adb_path, &full, self.timeout)
    }

    /// Run `adb shell` against this device, returning trimmed stdout text
    pub fn shell(&self, args: &[&str]) -> DeviceResult<String> {
        let mut full: Vec<&str> = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.exec(&full)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

/// A physical or virtual device behind adb, usable by the step loop
#[derive(Debug)]
pub struct AdbDevice {
    bridge: AdbBridge,
    viewport: Option<Viewport>,
}

impl AdbDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            bridge: AdbBridge::new(serial),
            viewport: None,
        }
    }

    pub fn with_bridge(bridge: AdbBridge) -> Self {
        Self {
            bridge,
            viewport: None,
        }
    }

    fn viewport(&mut self) -> Viewport {
        if self.viewport.is_none() {
            self.viewport = Some(observer::screen_viewport(&self.bridge));
        }
        self.viewport.unwrap_or_default()
    }
}

impl DeviceIo for AdbDevice {
    fn device_id(&self) -> &str {
        self.bridge.serial()
    }

    fn capture_observation(&mut self) -> DeviceResult<Observation> {
        let viewport = self.viewport();
        let screenshot = observer::screenshot(&self.bridge)?;
        let layout_xml = observer::layout_xml(&self.bridge)?;
        let elements = ui::simplify(&layout_xml, viewport)
            .map_err(|e| DeviceError::Unreachable(e.to_string()))?;
        let listing = ui::render_elements(&elements);
        Ok(Observation {
            screenshot,
            layout_xml,
            elements,
            listing,
        })
    }

    fn dispatch_action(
        &mut self,
        action: &crate::action::Action,
        elements: &[crate::ui::Element],
    ) -> DeviceResult<()> {
        let viewport = self.viewport();
        actuator::dispatch(&self.bridge, viewport, action, elements)
    }
}
