//! Bridge-tool (adb) invocation
//!
//! Thin wrapper around the `adb` binary: path resolution, one-shot command
//! execution, the `adb devices` table parser, and construction of the
//! long-lived logcat stream command.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use droidrun_core::prelude::*;
use tokio::process::Command;

use crate::config::Settings;

const ADB_DEVICES_WARNING: &str =
    "Received unfamiliar output from \"adb devices\". The device list may have errors.";

/// Captured output of a finished tool invocation
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    success: bool,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.success
    }

    /// Iterate over stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

impl std::fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)?;
        if !self.stderr.is_empty() {
            write!(f, "\n{}", self.stderr)?;
        }
        Ok(())
    }
}

/// Handle on a resolved adb binary
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
}

impl Adb {
    /// Resolve the adb binary: explicit setting, then the SDK's
    /// platform-tools folder, then PATH.
    pub fn locate(settings: &Settings) -> Result<Self> {
        if let Some(path) = &settings.adb {
            if path.exists() {
                return Ok(Self::at(path));
            }
            warn!("Configured adb path does not exist: {}", path.display());
        }

        if let Some(sdk) = settings.sdk_root() {
            let name = if cfg!(windows) { "adb.exe" } else { "adb" };
            let candidate = sdk.join("platform-tools").join(name);
            if candidate.exists() {
                return Ok(Self::at(&candidate));
            }
        }

        if let Ok(path) = which::which("adb") {
            return Ok(Self::at(&path));
        }

        Err(Error::AdbNotFound)
    }

    /// Use a specific adb binary
    pub fn at(path: &Path) -> Self {
        let path = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run adb with the given arguments and wait for it to finish
    pub async fn run(&self, args: &[&str]) -> Result<ProcessResult> {
        debug!("adb {}", args.join(" "));

        let output = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::tool(format!("failed to run adb: {}", e)))?;

        Ok(ProcessResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            success: output.status.success(),
        })
    }

    /// Run `adb -s <id> <args...>`
    pub async fn run_device(&self, id: &str, args: &[&str]) -> Result<ProcessResult> {
        let mut full = vec!["-s", id];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    /// Query a system property on a device; empty string when unavailable
    pub async fn getprop(&self, id: &str, prop: &str) -> Result<String> {
        let result = self.run_device(id, &["shell", "getprop", prop]).await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Enumerate attached devices that are in the ready (`device`) state
    ///
    /// Unauthorized/offline entries are skipped, not errored.
    pub async fn devices(&self) -> Result<Vec<String>> {
        let result = self.run(&["devices"]).await?;
        if !result.succeeded() {
            return Err(Error::tool(format!("adb devices failed: {}", result)));
        }
        Ok(parse_device_list(&result.stdout))
    }

    /// Build the long-lived `adb -s <id> logcat` command
    ///
    /// The brief output format matches the [`droidrun_core::LogEntry`]
    /// grammar. The returned command has not been spawned yet.
    pub fn logcat_command(&self, id: &str) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.args(["-s", id, "logcat", "-v", "brief"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Best-effort reset of the adb background server
    ///
    /// When an emulator launch times out the device list sometimes refuses
    /// to update until the server is restarted.
    pub async fn kill_server(&self) {
        info!("Shutting down any existing adb server...");
        if let Err(e) = self.run(&["kill-server"]).await {
            warn!("adb kill-server failed: {}", e);
        }
    }
}

/// Parse the `adb devices` table
///
/// ```text
/// List of devices attached
/// HT91MLC00031\tdevice
/// emulator-5566\toffline
/// ```
///
/// Only rows in the `device` state are returned. An unfamiliar header is a
/// warning, not an error.
fn parse_device_list(stdout: &str) -> Vec<String> {
    if !(stdout.contains("List of devices") || stdout.trim().is_empty()) {
        warn!("{}", ADB_DEVICES_WARNING);
        warn!("Output was \"{}\"", stdout);
        return Vec::new();
    }

    stdout
        .lines()
        .filter(|line| line.contains('\t'))
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?;
            let state = fields.next()?;
            (state == "device").then(|| id.to_string())
        })
        .collect()
}
