//! Launches a sketch on a device or in the emulator
//!
//! Orchestrates acquire → validate → install → start against a device handle
//! and translates crash reports from the log stream into source-mapped
//! errors via the build collaborator.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use droidrun_core::prelude::*;
use droidrun_device::{Device, DeviceEvent, DeviceRegistry, PendingAcquisition};
use regex::Regex;
use tokio::sync::broadcast;

use crate::build::{BuildArtifact, ComponentKind};
use crate::status::RunnerStatus;

/// One poll per second for about two minutes
const DEVICE_WAIT_ATTEMPTS: u32 = 120;
const DEVICE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Package prefix of the runtime library that wraps sketch code; the first
/// stack frame containing it is the one worth mapping back to the sketch.
const RUNTIME_PACKAGE_MARKER: &str = "droidrun.runtime";

// \tat droidrun.runtime.Sketch.draw(Sketch.java:42)
static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^:]+):(\d+)\)").expect("invalid location regex"));

// java.lang.RuntimeException: something went wrong
static EXCEPTION_PARSER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([a-z]+(?:\.[a-z]+)+)(?:: .+)?$").expect("invalid exception regex")
});

/// Orchestrates install and launch against an acquired device
pub struct Runner {
    build: Arc<dyn BuildArtifact>,
    status: Arc<dyn RunnerStatus>,
    registry: Arc<DeviceRegistry>,
    last_run_device: Mutex<Option<Arc<Device>>>,
}

impl Runner {
    pub fn new(
        build: Arc<dyn BuildArtifact>,
        status: Arc<dyn RunnerStatus>,
        registry: Arc<DeviceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            build,
            status,
            registry,
            last_run_device: Mutex::new(None),
        })
    }

    /// Wait for the acquisition, validate compatibility, install, and start
    ///
    /// Every failure path reports through [`RunnerStatus`] and returns
    /// `false`; nothing is thrown past this method.
    pub async fn launch(
        &self,
        acquisition: PendingAcquisition,
        component: ComponentKind,
        emu: bool,
    ) -> bool {
        let dev_str = if emu { "emulator" } else { "device" };
        self.status
            .notice(&format!("Waiting for {} to become available...", dev_str));

        let device = match self.wait_for_device(acquisition).await {
            Some(device) if device.is_alive() => device,
            _ => {
                self.status.error(&format!(
                    "Lost connection with {} while launching. Try again.",
                    dev_str
                ));
                // Reset the server, in case that's the problem. Sometimes
                // when an emulator launch times out, the device list refuses
                // to update until the server restarts.
                self.registry.kill_adb_server().await;
                return false;
            }
        };

        // a watch face only runs on a watch, and a watch runs nothing else
        if component.is_watch_face() && !device.has_feature("watch") {
            self.status.error("Could not install the sketch.");
            self.status.error(
                "You are trying to install a watch face on a non-watch device. \
                 Select the correct device, or use the emulator.",
            );
            return false;
        }
        if !component.is_watch_face() && device.has_feature("watch") {
            self.status.error("Could not install the sketch.");
            self.status.error(
                "You are trying to install a non-watch sketch on a watch. \
                 Select the correct device, or use the emulator.",
            );
            return false;
        }

        self.listen(&device);
        device.set_package_name(&self.build.package_name());
        device.set_sketch_class_name(&self.build.main_class_name());

        self.status
            .notice(&format!("Installing sketch on {}", device.id()));
        let Some(apk) = self.build.artifact_path() else {
            self.status.error("Could not install the sketch.");
            self.status.error("The APK file is missing");
            return false;
        };
        if let Err(e) = device.install_app(&apk).await {
            match e {
                Error::Install { message } => {
                    self.status
                        .error(&format!("Error while installing: {}", message));
                }
                e => {
                    error!("install failed: {}", e);
                    self.status.error(&format!(
                        "Lost connection with {} while installing. Try again.",
                        dev_str
                    ));
                    self.registry.kill_adb_server().await;
                }
            }
            return false;
        }
        self.status.notice("Done installing.");

        let where_str = if device.is_emulator() {
            "in the emulator"
        } else {
            "on the device"
        };
        let ok = if component.installs_only() {
            // wallpapers and watch faces are selected from a system chooser;
            // installing is the whole deployment
            self.status
                .notice(&format!("Sketch installed {}.", where_str));
            true
        } else {
            self.status
                .notice(&format!("Starting sketch on {}", device.id()));
            match device.launch_app().await {
                Ok(()) => {
                    self.status
                        .notice(&format!("Sketch launched {}.", where_str));
                    true
                }
                Err(e) => {
                    error!("launch failed: {}", e);
                    self.status.error("Could not start the sketch.");
                    false
                }
            }
        };

        *self.last_run_device.lock().expect("lock poisoned") = Some(device);
        ok
    }

    /// Poll the acquisition with a bounded retry budget
    ///
    /// A halted caller cancels the acquisition; a resolution error is
    /// reported; running out of budget cancels and gives up.
    async fn wait_for_device(&self, mut acquisition: PendingAcquisition) -> Option<Arc<Device>> {
        for _ in 0..DEVICE_WAIT_ATTEMPTS {
            if self.status.is_halted() {
                acquisition.cancel();
                return None;
            }
            match acquisition.poll_result() {
                Some(Ok(device)) => return Some(device),
                Some(Err(e)) => {
                    self.status.error(&e.to_string());
                    return None;
                }
                None => {}
            }
            tokio::time::sleep(DEVICE_WAIT_INTERVAL).await;
        }
        acquisition.cancel();
        self.status
            .error("Giving up on waiting for that device to show up.");
        None
    }

    /// Drain the device's event channel on a background task
    fn listen(&self, device: &Arc<Device>) {
        let mut events = device.subscribe();
        let build = Arc::clone(&self.build);
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Stopped) => {
                        // delivered at-least-once; halting twice is harmless
                        status.halt();
                    }
                    Ok(DeviceEvent::Crashed { pid, trace }) => {
                        debug!("sketch crashed (pid {})", pid);
                        report_trace(build.as_ref(), status.as_ref(), &trace);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Turn an accumulated stack trace into a source-mapped error
    pub fn report_stack_trace(&self, trace: &[String]) {
        report_trace(self.build.as_ref(), self.status.as_ref(), trace);
    }

    /// Best-effort: foreground the launcher on the last launched device
    ///
    /// Never force-kills the running sketch.
    pub async fn close(&self) {
        let device = self.last_run_device.lock().expect("lock poisoned").clone();
        if let Some(device) = device {
            device.bring_launcher_to_front().await;
        }
    }
}

/// The first line names the exception; the first subsequent frame that
/// points into the runtime library carries the `(file:line)` worth mapping
/// back to the sketch.
fn report_trace(build: &dyn BuildArtifact, status: &dyn RunnerStatus, trace: &[String]) {
    let Some(exception_line) = trace.first() else {
        return;
    };

    let Some(caps) = EXCEPTION_PARSER.captures(exception_line) else {
        eprintln!("Can't parse this exception line:");
        eprintln!("{}", exception_line);
        status.error("Unknown exception");
        return;
    };
    let exception_class = caps[1].to_string();

    for frame in &trace[1..] {
        if !frame.contains(RUNTIME_PACKAGE_MARKER) {
            continue;
        }
        if let Some(loc) = LOCATION.captures(frame) {
            let file = loc[1].to_string();
            let line: u32 = match loc[2].parse::<u32>() {
                Ok(n) => n.saturating_sub(1),
                Err(_) => continue,
            };
            match build.map_to_source(exception_line, &file, line) {
                Some(err) => status.error(&err.to_string()),
                None => status.error(exception_line),
            }
            return;
        }
    }

    // no frame pointed into the runtime; at least name the exception
    status.error(&exception_class);
}
