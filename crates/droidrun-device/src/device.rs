//! A single attached device
//!
//! Each [`Device`] owns one long-lived logcat subprocess and classifies its
//! output line by line: tracking the pids belonging to the installed sketch,
//! accumulating runtime stack traces, and turning the OS crash signals into
//! [`DeviceEvent`]s. A supervisor task watches the subprocess so the handle
//! shuts down even when logcat dies unexpectedly.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use droidrun_core::prelude::*;
use droidrun_core::{LogEntry, Severity};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot};

use crate::adb::Adb;
use crate::events::DeviceEvent;

/// Registry map shared between the registry and its handles; a handle
/// removes itself on shutdown.
pub(crate) type DeviceMap = Arc<Mutex<HashMap<String, Arc<Device>>>>;

/// Fixed prefix of lifecycle markers logged by old runtime library versions
const LEGACY_MARKER_PREFIX: &str = "DROIDRUN";

/// Anchor phrase of the process-start line in the system log
const START_PROC_ANCHOR: &str = "Start proc";

/// Anchor phrase of the process-kill line in the system log
const KILL_ANCHOR: &str = "Killing";

/// Source tag of the OS process-death channel
const PROCESS_SOURCE: &str = "Process";

/// Source tag of uncaught-exception stack traces
const RUNTIME_SOURCE: &str = "AndroidRuntime";

/// Boilerplate first line of every uncaught-exception report; not a frame
const UNCAUGHT_BOILERPLATE: &str = "Uncaught handler";

/// Signal delivered when the sketch crashed and the dialog is shown;
/// signal 9 follows once the user dismisses it and must not re-report.
const CRASH_DIALOG_SIGNAL: u32 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// I/Process ( 9213): Sending signal. PID: 9213 SIG: 9
static SIG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PID:\s+(\d+)\s+SIG:\s+(\d+)").expect("invalid signal regex"));

/// One attached device (hardware or emulator)
pub struct Device {
    id: String,
    name: String,
    /// Comma-joined `ro.build.characteristics` values, e.g. ",watch"
    features: String,
    adb: Adb,
    devices: DeviceMap,
    package_name: Mutex<String>,
    sketch_class_name: Mutex<String>,
    active_processes: Mutex<HashSet<u32>>,
    stack_trace: Mutex<Vec<String>>,
    events: broadcast::Sender<DeviceEvent>,
    alive: AtomicBool,
    /// Tells the supervisor task to kill the logcat subprocess. Consumed on
    /// first use.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Device {
    pub(crate) fn new(
        id: String,
        name: String,
        features: String,
        adb: Adb,
        devices: DeviceMap,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            name,
            features,
            adb,
            devices,
            package_name: Mutex::new(String::new()),
            sketch_class_name: Mutex::new(String::new()),
            active_processes: Mutex::new(HashSet::new()),
            stack_trace: Mutex::new(Vec::new()),
            events,
            alive: AtomicBool::new(true),
            kill_tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name: brand + model + `[id]`, queried once at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_emulator(&self) -> bool {
        self.id.starts_with("emulator")
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Package whose processes this handle tracks
    pub fn set_package_name(&self, package: &str) {
        *self.package_name.lock().expect("lock poisoned") = package.to_string();
    }

    pub fn set_sketch_class_name(&self, class_name: &str) {
        *self.sketch_class_name.lock().expect("lock poisoned") = class_name.to_string();
    }

    /// Subscribe to stop/crash notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────
    // Log stream lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Clear the log backlog and start streaming
    ///
    /// Spawns one reader per output stream plus a supervisor that blocks on
    /// subprocess exit and shuts the handle down on every exit path.
    pub async fn initialize(self: Arc<Self>) -> Result<()> {
        self.adb.run_device(&self.id, &["logcat", "-c"]).await?;

        let mut child = self
            .adb
            .logcat_command(&self.id)
            .spawn()
            .map_err(|e| Error::tool(format!("failed to start logcat: {}", e)))?;

        let stdout = child.stdout.take().expect("stdout was configured");
        let device = Arc::clone(&self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                device.process_line(&line);
            }
            debug!("log reader finished for {}", device.id);
        });

        let stderr = child.stderr.take().expect("stderr was configured");
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{}", line);
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *self.kill_tx.lock().expect("lock poisoned") = Some(kill_tx);

        // Supervisor: owns the child, waits for it to exit. Shutdown runs on
        // every path, so a disconnect or reboot mid-run still notifies
        // listeners.
        let device = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => debug!("logcat for {} exited: {:?}", device.id, status),
                        Err(e) => error!("error waiting for logcat ({}): {}", device.id, e),
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        error!("failed to kill logcat for {}: {}", device.id, e);
                    }
                    let _ = child.wait().await;
                }
            }
            device.shutdown().await;
        });

        Ok(())
    }

    /// Tear the handle down
    ///
    /// Idempotent: only the first call terminates the subprocess, removes
    /// the handle from the registry, and (if a sketch was running) sends the
    /// implicit stop notification.
    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("{} is shutting down", self.id);

        if let Some(tx) = self.kill_tx.lock().expect("lock poisoned").take() {
            let _ = tx.send(());
        }

        if self
            .devices
            .lock()
            .expect("lock poisoned")
            .remove(&self.id)
            .is_none()
        {
            debug!("device {} was not in the registry", self.id);
        }

        let had_active = !self.active_processes.lock().expect("lock poisoned").is_empty();
        if had_active {
            let _ = self.events.send(DeviceEvent::Stopped);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Classifier
    // ─────────────────────────────────────────────────────────────

    /// Feed one raw logcat line through the classifier
    ///
    /// Normally called by the stream reader task; public so alternative
    /// stream sources can drive the same state machine.
    pub fn process_line(&self, line: &str) {
        let entry = match LogEntry::parse(line) {
            Ok(entry) => entry,
            Err(_) => {
                // vendor-injected noise, buffer separators, etc.
                trace!("skipping unparseable log line: {}", line);
                return;
            }
        };
        self.classify(&entry);
    }

    fn classify(&self, entry: &LogEntry) {
        let package = self.package_name.lock().expect("lock poisoned").clone();

        if entry.message.starts_with(LEGACY_MARKER_PREFIX) {
            // Old start/stop detection via explicit runtime markers. Newer
            // runtimes never log these, but devices running old sketches do.
            if entry.message.contains("onStart") {
                self.start_proc(entry.pid);
            } else if entry.message.contains("onStop") {
                self.end_proc(entry.pid);
            }
        } else if !package.is_empty()
            && entry.message.contains(START_PROC_ANCHOR)
            && entry.message.contains(&package)
        {
            // "Start proc 29318:sketchbook.test001/u0a403 for activity ..."
            match extract_pid(&entry.message, START_PROC_ANCHOR, &package)
                .or_else(|| extract_pid_fallback(&entry.message))
            {
                Some(pid) => self.start_proc(pid),
                None => {
                    warn!(
                        "{}: cannot find process id, console output will be disabled",
                        self.id
                    );
                }
            }
        } else if !package.is_empty()
            && entry.message.contains(KILL_ANCHOR)
            && entry.message.contains(&package)
        {
            // "Killing 31360:sketchbook.test001/u0a403 (adj 900): remove task"
            match extract_pid(&entry.message, KILL_ANCHOR, &package) {
                Some(pid) => self.end_proc(pid),
                None => {
                    warn!(
                        "{}: cannot find process id, console output will continue. {}",
                        self.id, package
                    );
                }
            }
        } else if entry.source == PROCESS_SOURCE {
            self.handle_signal(entry);
        } else if self.is_tracking(entry.pid) {
            self.handle_console(entry);
        }
    }

    fn handle_signal(&self, entry: &LogEntry) {
        let Some(caps) = SIG.captures(&entry.message) else {
            return;
        };
        let pid: u32 = match caps[1].parse() {
            Ok(pid) => pid,
            Err(_) => return,
        };
        let signal: u32 = match caps[2].parse() {
            Ok(signal) => signal,
            Err(_) => return,
        };

        // only report crashes of the sketch we are tracking; the signal 9
        // that follows a dismissed crash dialog arrives for an already
        // untracked pid and must not re-report
        if !self.is_tracking(pid) {
            return;
        }
        if signal == CRASH_DIALOG_SIGNAL {
            self.end_proc(pid);
            self.report_crash(pid);
        }
    }

    fn handle_console(&self, entry: &LogEntry) {
        let is_stack_trace = entry.source == RUNTIME_SOURCE && entry.severity == Severity::Error;
        if is_stack_trace {
            if !entry.message.starts_with(UNCAUGHT_BOILERPLATE) {
                self.stack_trace
                    .lock()
                    .expect("lock poisoned")
                    .push(entry.message.clone());
                eprintln!("{}", entry.message);
            }
        } else if entry.source == "System.out" || entry.source == "System.err" {
            if entry.severity.uses_error_stream() {
                eprintln!("{}", entry.message);
            } else {
                println!("{}", entry.message);
            }
        }
    }

    fn report_crash(&self, pid: u32) {
        let trace = std::mem::take(&mut *self.stack_trace.lock().expect("lock poisoned"));
        if trace.is_empty() {
            warn!("Proc {} got signal 3, but there's no stack trace", pid);
        }
        let _ = self.events.send(DeviceEvent::Crashed { pid, trace });
    }

    fn start_proc(&self, pid: u32) {
        debug!("{}: tracking pid {}", self.id, pid);
        self.active_processes.lock().expect("lock poisoned").insert(pid);
    }

    fn end_proc(&self, pid: u32) {
        debug!("{}: pid {} stopped", self.id, pid);
        self.active_processes.lock().expect("lock poisoned").remove(&pid);
        let _ = self.events.send(DeviceEvent::Stopped);
    }

    fn is_tracking(&self, pid: u32) -> bool {
        self.active_processes.lock().expect("lock poisoned").contains(&pid)
    }

    // ─────────────────────────────────────────────────────────────
    // Per-device tool commands
    // ─────────────────────────────────────────────────────────────

    /// Install the sketch package, replacing any previous install
    ///
    /// A `Failure` line mentioning inconsistent certificates means the
    /// previous install was signed with a different key: uninstall it and
    /// retry once. Any other failure aborts with the raw tool output.
    pub async fn install_app(&self, apk: &Path) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::device_lost(&self.id));
        }
        self.bring_launcher_to_front().await;

        let apk_str = apk.to_string_lossy().to_string();
        let mut retried = false;
        loop {
            let result = self
                .adb
                .run_device(&self.id, &["install", "-r", &apk_str])
                .await?;
            if !result.succeeded() {
                return Err(Error::install(result.to_string()));
            }

            let failure = result
                .lines()
                .find(|line| line.starts_with("Failure"))
                .map(str::to_string);
            match failure {
                None => return Ok(()),
                Some(line)
                    if !retried
                        && line.contains("INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES") =>
                {
                    let package = self.package_name.lock().expect("lock poisoned").clone();
                    warn!(
                        "{} has a previous install signed with a different key, uninstalling",
                        package
                    );
                    self.remove_app(&package).await?;
                    retried = true;
                }
                Some(line) => {
                    return Err(Error::install(line["Failure".len()..].trim().to_string()));
                }
            }
        }
    }

    /// Uninstall a package
    pub async fn remove_app(&self, package: &str) -> Result<()> {
        let result = self.adb.run_device(&self.id, &["uninstall", package]).await?;
        if !result.succeeded() {
            return Err(Error::install(format!(
                "could not uninstall {}: {}",
                package, result
            )));
        }
        Ok(())
    }

    /// Send the launch intent for the sketch's main activity
    pub async fn launch_app(&self) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::device_lost(&self.id));
        }
        let package = self.package_name.lock().expect("lock poisoned").clone();
        let class_name = self.sketch_class_name.lock().expect("lock poisoned").clone();
        let component = format!("{}/.{}", package, class_name);

        let result = self
            .adb
            .run_device(
                &self.id,
                &[
                    "shell",
                    "am",
                    "start",
                    "-e",
                    "debug",
                    "true",
                    "-a",
                    "android.intent.action.MAIN",
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "-n",
                    &component,
                ],
            )
            .await?;

        // "Error type 2 / android.util.AndroidException: Can't connect to
        // activity manager" shows up on stdout even though the tool exits 0
        if result.stdout.contains("android.util.AndroidException") {
            return Err(Error::tool(result.stdout.clone()));
        }
        if !result.succeeded() {
            return Err(Error::tool(result.to_string()));
        }
        Ok(())
    }

    /// Best-effort: bring the home screen to the foreground
    pub async fn bring_launcher_to_front(&self) {
        let result = self
            .adb
            .run_device(
                &self.id,
                &[
                    "shell",
                    "am",
                    "start",
                    "-a",
                    "android.intent.action.MAIN",
                    "-c",
                    "android.intent.category.HOME",
                ],
            )
            .await;
        if let Err(e) = result {
            warn!("could not bring the launcher to the front: {}", e);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Extract the pid strictly between the anchor phrase and the package name
///
/// The surrounding text varies across device vendors, but the anchor and the
/// package-name occurrence are stable, so the pid is whatever sits between
/// them (minus the trailing separator).
fn extract_pid(message: &str, anchor: &str, package: &str) -> Option<u32> {
    let start = message.find(anchor)? + anchor.len() + 1;
    let end = message.find(package)?.checked_sub(1)?;
    message.get(start..end)?.trim().parse().ok()
}

/// Older bridge tools phrase the start line as `... pid=4256 uid=10175 ...`
fn extract_pid_fallback(message: &str) -> Option<u32> {
    let start = message.find("pid=")? + 4;
    let end = message.find("uid")?.checked_sub(1)?;
    message.get(start..end)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    const PACKAGE: &str = "sketchbook.test001";

    fn test_device() -> Arc<Device> {
        let device = Arc::new(Device::new(
            "emulator-5566".to_string(),
            "emulator-5566 [emulator-5566]".to_string(),
            String::new(),
            Adb::at(Path::new("/nonexistent/adb")),
            Arc::new(Mutex::new(HashMap::new())),
        ));
        device.set_package_name(PACKAGE);
        device.set_sketch_class_name("MainActivity");
        device
    }

    fn start_line(pid: u32) -> String {
        format!(
            "I/ActivityManager(  648): Start proc {}:{}/u0a403 for activity {}/.MainActivity",
            pid, PACKAGE, PACKAGE
        )
    }

    fn kill_line(pid: u32) -> String {
        format!(
            "I/ActivityManager(  648): Killing {}:{}/u0a403 (adj 900): remove task",
            pid, PACKAGE
        )
    }

    fn signal_line(pid: u32, signal: u32) -> String {
        format!(
            "I/Process ( {pid}): Sending signal. PID: {pid} SIG: {signal}",
            pid = pid,
            signal = signal
        )
    }

    #[test]
    fn test_extract_pid_two_anchor() {
        let msg = format!("Start proc 29318:{}/u0a403 for activity {}/.Main", PACKAGE, PACKAGE);
        assert_eq!(extract_pid(&msg, "Start proc", PACKAGE), Some(29318));

        let msg = format!("Killing 31360:{}/u0a403 (adj 900): remove task", PACKAGE);
        assert_eq!(extract_pid(&msg, "Killing", PACKAGE), Some(31360));
    }

    #[test]
    fn test_extract_pid_rejects_missing_anchor() {
        assert_eq!(extract_pid("no anchors here", "Start proc", PACKAGE), None);
        let msg = format!("Start proc garbage {}", PACKAGE);
        assert_eq!(extract_pid(&msg, "Start proc", PACKAGE), None);
    }

    #[test]
    fn test_extract_pid_fallback_phrasing() {
        let msg = format!(
            "Start proc {} for activity {}/.Main: pid=4256 uid=10175 gids={{50175}}",
            PACKAGE, PACKAGE
        );
        // the two-anchor form fails here, the fallback succeeds
        assert_eq!(extract_pid(&msg, "Start proc", PACKAGE), None);
        assert_eq!(extract_pid_fallback(&msg), Some(4256));
    }

    #[test]
    fn test_start_output_kill_sequence() {
        let device = test_device();
        let mut events = device.subscribe();

        device.process_line(&start_line(555));
        assert!(device.is_tracking(555));

        device.process_line("I/System.out(  555): hello from the sketch");
        // console output is not a stack trace and produces no event
        assert!(device.stack_trace.lock().unwrap().is_empty());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        device.process_line(&kill_line(555));
        assert!(!device.is_tracking(555));
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Stopped);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_fallback_start_line_is_tracked() {
        let device = test_device();
        let line = format!(
            "I/ActivityManager(  648): Start proc {} for activity {}/.Main: pid=4256 uid=10175 gids={{50175}}",
            PACKAGE, PACKAGE
        );
        device.process_line(&line);
        assert!(device.is_tracking(4256));
    }

    #[test]
    fn test_crash_flushes_buffered_trace_once() {
        let device = test_device();
        let mut events = device.subscribe();

        device.process_line(&start_line(555));
        device.process_line("E/AndroidRuntime(  555): Uncaught handler: thread main exiting");
        device.process_line("E/AndroidRuntime(  555): java.lang.RuntimeException: boom");
        device.process_line("E/AndroidRuntime(  555): \tat droidrun.runtime.Sketch.draw(Sketch.java:42)");

        device.process_line(&signal_line(555, 3));
        assert!(!device.is_tracking(555));

        // pid removal notifies the stop first, then the crash report flushes
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Stopped);
        match events.try_recv().unwrap() {
            DeviceEvent::Crashed { pid, trace } => {
                assert_eq!(pid, 555);
                assert_eq!(
                    trace,
                    vec![
                        "java.lang.RuntimeException: boom".to_string(),
                        "\tat droidrun.runtime.Sketch.draw(Sketch.java:42)".to_string(),
                    ]
                );
            }
            other => panic!("expected Crashed, got {:?}", other),
        }

        // the buffer was cleared by the flush
        assert!(device.stack_trace.lock().unwrap().is_empty());

        // the follow-up signal 9 for the now-untracked pid is a no-op
        device.process_line(&signal_line(555, 9));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_signal_for_untracked_pid_is_ignored() {
        let device = test_device();
        let mut events = device.subscribe();
        device.process_line(&signal_line(999, 3));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_legacy_markers_drive_lifecycle() {
        let device = test_device();
        let mut events = device.subscribe();

        device.process_line("I/Sketch(  777): DROIDRUN lifecycle onStart");
        assert!(device.is_tracking(777));

        device.process_line("I/Sketch(  777): DROIDRUN lifecycle onStop");
        assert!(!device.is_tracking(777));
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Stopped);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let device = test_device();

        device.process_line("--------- beginning of main");
        device.process_line(&start_line(555));
        device.process_line("not a log line at all");
        assert!(device.is_tracking(555));
    }

    #[test]
    fn test_untracked_console_output_is_ignored() {
        let device = test_device();
        device.process_line("E/AndroidRuntime(  999): java.lang.RuntimeException: not ours");
        assert!(device.stack_trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let device = test_device();
        let mut events = device.subscribe();

        device.process_line(&start_line(555));

        device.shutdown().await;
        assert!(!device.is_alive());
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Stopped);

        // second shutdown: no second stop notification, no panic
        device.shutdown().await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_shutdown_without_active_processes_is_silent() {
        let device = test_device();
        let mut events = device.subscribe();

        device.shutdown().await;
        assert!(!device.is_alive());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_shutdown_removes_handle_from_registry_map() {
        let map: DeviceMap = Arc::new(Mutex::new(HashMap::new()));
        let device = Arc::new(Device::new(
            "serial123".to_string(),
            "serial123".to_string(),
            String::new(),
            Adb::at(Path::new("/nonexistent/adb")),
            Arc::clone(&map),
        ));
        map.lock()
            .unwrap()
            .insert(device.id().to_string(), Arc::clone(&device));

        device.shutdown().await;
        assert!(map.lock().unwrap().is_empty());
    }

    #[test]
    fn test_feature_flags() {
        let device = Arc::new(Device::new(
            "serial123".to_string(),
            "Gear Live [serial123]".to_string(),
            ",watch".to_string(),
            Adb::at(Path::new("/nonexistent/adb")),
            Arc::new(Mutex::new(HashMap::new())),
        ));
        assert!(device.has_feature("watch"));
        assert!(!device.has_feature("tv"));
        assert!(!device.is_emulator());
    }

    #[tokio::test]
    async fn test_install_requires_live_handle() {
        let device = test_device();
        device.shutdown().await;
        let err = device.install_app(Path::new("/tmp/sketch.apk")).await.unwrap_err();
        assert!(matches!(err, Error::DeviceLost { .. }));
    }
}
