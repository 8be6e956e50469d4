//! Process-wide device catalog
//!
//! The registry discovers devices through the bridge tool, owns one
//! [`Device`] handle per id, and serializes "give me a device" requests on a
//! single worker task so at most one acquisition -- and at most one emulator
//! boot -- is ever in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidrun_core::prelude::*;
use tokio::sync::{mpsc, oneshot};

use crate::adb::Adb;
use crate::device::{Device, DeviceMap};
use crate::emulator::{avd_port, EmulatorController, EmulatorState};

/// How often the acquisition worker re-enumerates while waiting
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(2);

const ACQUIRE_QUEUE_CAPACITY: usize = 8;

/// An in-flight "find a matching device" request
///
/// Resolves to a device handle, fails, or is cancelled. Cancellation is
/// cooperative: the worker checks the flag between polls. There is no
/// internal timeout -- the caller bounds the wait.
pub struct PendingAcquisition {
    rx: oneshot::Receiver<Result<Arc<Device>>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingAcquisition {
    /// Ask the worker to abandon this request
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Non-blocking check for the outcome
    pub fn poll_result(&mut self) -> Option<Result<Arc<Device>>> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::ChannelClosed)),
        }
    }

    /// Wait for the outcome without a bound
    pub async fn wait(self) -> Result<Arc<Device>> {
        self.rx.await.map_err(|_| Error::ChannelClosed)?
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl PendingAcquisition {
    /// A pre-resolved acquisition for tests
    pub fn resolved(result: Result<Arc<Device>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

enum AcquireKind {
    Emulator { wear: bool, gpu: bool },
    Hardware,
}

struct AcquireRequest {
    kind: AcquireKind,
    cancelled: Arc<AtomicBool>,
    reply: oneshot::Sender<Result<Arc<Device>>>,
}

/// Catalog of currently known devices
pub struct DeviceRegistry {
    adb: Adb,
    devices: DeviceMap,
    emulator: Arc<dyn EmulatorController>,
    acquire_tx: mpsc::Sender<AcquireRequest>,
    poll_interval: Duration,
}

impl DeviceRegistry {
    pub fn new(adb: Adb, emulator: Arc<dyn EmulatorController>) -> Arc<Self> {
        Self::with_poll_interval(adb, emulator, ACQUIRE_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        adb: Adb,
        emulator: Arc<dyn EmulatorController>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (acquire_tx, acquire_rx) = mpsc::channel(ACQUIRE_QUEUE_CAPACITY);
        let registry = Arc::new(Self {
            adb,
            devices: Arc::new(Mutex::new(HashMap::new())),
            emulator,
            acquire_tx,
            poll_interval,
        });
        tokio::spawn(Self::acquisition_worker(Arc::clone(&registry), acquire_rx));
        registry
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    /// Snapshot of the currently known handles
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.lock().expect("lock poisoned").values().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────

    /// Re-enumerate attached devices and add a handle for every new one
    ///
    /// Enumeration failure degrades to "no devices": logged, never fatal, so
    /// one flaky adb invocation can't disable the registry.
    pub async fn refresh(&self) {
        let ids = match self.adb.devices().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                return;
            }
        };

        for id in ids {
            let known = self.devices.lock().expect("lock poisoned").contains_key(&id);
            if !known {
                self.add_device(id).await;
            }
        }
    }

    async fn add_device(&self, id: String) {
        // feature flags and the display name are queried once per handle
        let features = match self.adb.getprop(&id, "ro.build.characteristics").await {
            Ok(chars) => format!(",{}", chars.to_lowercase()),
            Err(_) => String::new(),
        };
        let name = self.query_name(&id).await;

        let device = Arc::new(Device::new(
            id.clone(),
            name,
            features,
            self.adb.clone(),
            Arc::clone(&self.devices),
        ));
        if let Err(e) = Arc::clone(&device).initialize().await {
            warn!("while initializing {}: {}", id, e);
            return;
        }

        let previous = self
            .devices
            .lock()
            .expect("lock poisoned")
            .insert(id.clone(), device);
        if let Some(previous) = previous {
            // a refresh raced a reconnect; the old handle is gone either way
            warn!("adding {}, which already existed", id);
            previous.shutdown().await;
        }
    }

    async fn query_name(&self, id: &str) -> String {
        let mut name = String::new();
        if let Ok(brand) = self.adb.getprop(id, "ro.product.brand").await {
            if !brand.is_empty() {
                name.push_str(&brand);
                name.push(' ');
            }
        }
        if let Ok(model) = self.adb.getprop(id, "ro.product.model").await {
            if !model.is_empty() {
                name.push_str(&model);
                name.push(' ');
            }
        }
        format!("{}[{}]", name, id)
    }

    /// Refresh, then return the first handle matching the emulator flag and
    /// (when given) whose name contains `name_hint`
    ///
    /// The hint is how a specific emulator instance is targeted: its console
    /// port appears in the handle name.
    pub async fn find(&self, want_emulator: bool, name_hint: Option<&str>) -> Option<Arc<Device>> {
        self.refresh().await;
        let devices = self.devices.lock().expect("lock poisoned");
        devices
            .values()
            .find(|device| {
                if let Some(hint) = name_hint {
                    if !device.name().contains(hint) {
                        return false;
                    }
                }
                device.is_emulator() == want_emulator
            })
            .cloned()
    }

    // ─────────────────────────────────────────────────────────────
    // Acquisition
    // ─────────────────────────────────────────────────────────────

    /// Request an emulator, booting one if necessary
    pub fn acquire_emulator(&self, wear: bool, gpu: bool) -> PendingAcquisition {
        self.enqueue(AcquireKind::Emulator { wear, gpu })
    }

    /// Request the first attached hardware device
    pub fn acquire_hardware(&self) -> PendingAcquisition {
        self.enqueue(AcquireKind::Hardware)
    }

    fn enqueue(&self, kind: AcquireKind) -> PendingAcquisition {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AcquireRequest {
            kind,
            cancelled: Arc::clone(&cancelled),
            reply: reply_tx,
        };
        if self.acquire_tx.try_send(request).is_err() {
            // dropping the reply sender resolves the pending to ChannelClosed
            warn!("acquisition queue unavailable");
        }
        PendingAcquisition {
            rx: reply_rx,
            cancelled,
        }
    }

    /// Single worker: requests are totally ordered, so duplicate emulator
    /// boots are impossible.
    async fn acquisition_worker(registry: Arc<Self>, mut rx: mpsc::Receiver<AcquireRequest>) {
        while let Some(request) = rx.recv().await {
            if request.cancelled.load(Ordering::Acquire) {
                let _ = request.reply.send(Err(Error::AcquisitionCancelled));
                continue;
            }
            let result = match request.kind {
                AcquireKind::Emulator { wear, gpu } => {
                    registry.resolve_emulator(wear, gpu, &request.cancelled).await
                }
                AcquireKind::Hardware => registry.resolve_hardware(&request.cancelled).await,
            };
            let _ = request.reply.send(result);
        }
    }

    async fn resolve_emulator(
        &self,
        wear: bool,
        gpu: bool,
        cancelled: &AtomicBool,
    ) -> Result<Arc<Device>> {
        let port = avd_port(wear);
        if let Some(device) = self.find(true, Some(port)).await {
            return Ok(device);
        }

        match self.emulator.state() {
            EmulatorState::NotRunning => {
                // blocks until the emulator boots or fails
                self.emulator.boot(wear, gpu).await.map_err(|e| {
                    error!("Problem while launching emulator: {}", e);
                    e
                })?;
            }
            state => {
                info!("Emulator is {:?}, which is not expected.", state);
            }
        }

        loop {
            if cancelled.load(Ordering::Acquire) {
                return Err(Error::AcquisitionCancelled);
            }
            if self.emulator.state() == EmulatorState::NotRunning {
                return Err(Error::emulator("error while starting the emulator"));
            }
            if let Some(device) = self.find(true, Some(port)).await {
                return Ok(device);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn resolve_hardware(&self, cancelled: &AtomicBool) -> Result<Arc<Device>> {
        if let Some(device) = self.find(false, None).await {
            return Ok(device);
        }
        loop {
            if cancelled.load(Ordering::Acquire) {
                return Err(Error::AcquisitionCancelled);
            }
            tokio::time::sleep(self.poll_interval).await;
            if let Some(device) = self.find(false, None).await {
                return Ok(device);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Shut down every known handle (process exit path)
    pub async fn shutdown_all(&self) {
        let devices = self.snapshot();
        for device in devices {
            device.shutdown().await;
        }
    }

    /// Best-effort reset of the bridge tool's background server
    pub async fn kill_adb_server(&self) {
        self.adb.kill_server().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;

    struct FakeEmulator {
        state: Mutex<EmulatorState>,
        boots: AtomicU32,
    }

    impl FakeEmulator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(EmulatorState::NotRunning),
                boots: AtomicU32::new(0),
            })
        }

        fn boot_count(&self) -> u32 {
            self.boots.load(Ordering::SeqCst)
        }
    }

    impl EmulatorController for FakeEmulator {
        fn state(&self) -> EmulatorState {
            *self.state.lock().unwrap()
        }

        fn boot(&self, _wear: bool, _gpu: bool) -> BoxFuture<'_, Result<()>> {
            async move {
                self.boots.fetch_add(1, Ordering::SeqCst);
                *self.state.lock().unwrap() = EmulatorState::Running;
                Ok(())
            }
            .boxed()
        }
    }

    fn test_registry(emulator: Arc<dyn EmulatorController>) -> Arc<DeviceRegistry> {
        DeviceRegistry::with_poll_interval(
            Adb::at(Path::new("/nonexistent/adb")),
            emulator,
            Duration::from_millis(10),
        )
    }

    fn insert_device(registry: &DeviceRegistry, id: &str) -> Arc<Device> {
        let device = Arc::new(Device::new(
            id.to_string(),
            format!("Acme Phone [{}]", id),
            String::new(),
            Adb::at(Path::new("/nonexistent/adb")),
            Arc::clone(&registry.devices),
        ));
        registry
            .devices
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&device));
        device
    }

    #[tokio::test]
    async fn test_refresh_absorbs_tool_failure() {
        let registry = test_registry(FakeEmulator::new());
        registry.refresh().await;
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_find_matches_flag_and_hint() {
        let registry = test_registry(FakeEmulator::new());
        insert_device(&registry, "serial123");
        insert_device(&registry, "emulator-5566");

        let hw = registry.find(false, None).await.unwrap();
        assert_eq!(hw.id(), "serial123");

        let emu = registry.find(true, Some("5566")).await.unwrap();
        assert_eq!(emu.id(), "emulator-5566");

        assert!(registry.find(true, Some("5576")).await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_emulator_resolves_existing_handle() {
        let emulator = FakeEmulator::new();
        let registry = test_registry(emulator.clone());
        insert_device(&registry, "emulator-5566");

        let pending = registry.acquire_emulator(false, true);
        let device = pending.wait().await.unwrap();
        assert_eq!(device.id(), "emulator-5566");
        assert_eq!(emulator.boot_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_boot_once() {
        let emulator = FakeEmulator::new();
        let registry = test_registry(emulator.clone());

        // no emulator ever appears in the (failing) enumeration, so both
        // requests sit in their poll loops until cancelled
        let first = registry.acquire_emulator(false, true);
        let second = registry.acquire_emulator(false, true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(emulator.boot_count(), 1);

        first.cancel();
        second.cancel();

        assert!(matches!(
            first.wait().await,
            Err(Error::AcquisitionCancelled)
        ));
        // the second request observes the first's outcome serially and never
        // triggers a boot of its own
        assert!(matches!(
            second.wait().await,
            Err(Error::AcquisitionCancelled)
        ));
        assert_eq!(emulator.boot_count(), 1);
    }

    #[tokio::test]
    async fn test_acquisition_fails_when_emulator_dies() {
        struct DyingEmulator;
        impl EmulatorController for DyingEmulator {
            fn state(&self) -> EmulatorState {
                EmulatorState::NotRunning
            }
            fn boot(&self, _wear: bool, _gpu: bool) -> BoxFuture<'_, Result<()>> {
                async move { Err(Error::emulator("boot failed")) }.boxed()
            }
        }

        let registry = test_registry(Arc::new(DyingEmulator));
        let pending = registry.acquire_emulator(false, true);
        assert!(matches!(pending.wait().await, Err(Error::Emulator { .. })));
    }

    #[tokio::test]
    async fn test_poll_result_reports_pending_then_outcome() {
        let registry = test_registry(FakeEmulator::new());
        insert_device(&registry, "emulator-5566");

        let mut pending = registry.acquire_emulator(false, true);
        // the worker may not have picked the request up yet
        for _ in 0..50 {
            if let Some(result) = pending.poll_result() {
                assert_eq!(result.unwrap().id(), "emulator-5566");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("acquisition never resolved");
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = test_registry(FakeEmulator::new());
        insert_device(&registry, "serial123");
        insert_device(&registry, "emulator-5566");

        registry.shutdown_all().await;
        assert!(registry.snapshot().is_empty());
    }
}
