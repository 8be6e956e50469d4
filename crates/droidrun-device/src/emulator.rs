//! Emulator control
//!
//! The registry consumes emulators through the [`EmulatorController`] trait;
//! [`SdkEmulator`] is the real implementation over the SDK's `emulator`
//! binary. Phone and wear emulators run on fixed console ports so a booted
//! instance can be matched back to the request that wanted it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidrun_core::prelude::*;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::process::Command;

use crate::adb::Adb;
use crate::config::Settings;

/// Fixed console port for the phone emulator
pub const PHONE_PORT: &str = "5566";
/// Fixed console port for the wear emulator
pub const WEAR_PORT: &str = "5576";

const PHONE_AVD: &str = "droidrun-phone";
const WEAR_AVD: &str = "droidrun-wear";

/// How often the boot poller checks `dev.bootcomplete`
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Poll attempts before giving up on a boot (~5 minutes)
const BOOT_POLL_ATTEMPTS: u32 = 150;

/// Console port an emulator for the given form factor listens on
pub fn avd_port(wear: bool) -> &'static str {
    if wear {
        WEAR_PORT
    } else {
        PHONE_PORT
    }
}

/// AVD name for the given form factor
pub fn avd_name(wear: bool) -> &'static str {
    if wear {
        WEAR_AVD
    } else {
        PHONE_AVD
    }
}

/// Lifecycle state of the managed emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    NotRunning,
    Booting,
    Running,
}

/// Something that can boot a virtual device on demand
///
/// `boot` blocks until the emulator has fully booted or failed; the
/// registry's acquisition worker awaits it, which is what guarantees at most
/// one boot in flight.
pub trait EmulatorController: Send + Sync {
    fn state(&self) -> EmulatorState;

    fn boot(&self, wear: bool, gpu: bool) -> BoxFuture<'_, Result<()>>;
}

/// Emulator controller backed by the SDK `emulator` binary
pub struct SdkEmulator {
    emulator_path: PathBuf,
    adb: Adb,
    state: Arc<Mutex<EmulatorState>>,
}

impl SdkEmulator {
    pub fn new(emulator_path: PathBuf, adb: Adb) -> Self {
        Self {
            emulator_path,
            adb,
            state: Arc::new(Mutex::new(EmulatorState::NotRunning)),
        }
    }

    /// Resolve the emulator binary: explicit setting, then the SDK's
    /// emulator folder, then PATH.
    pub fn locate(settings: &Settings, adb: Adb) -> Result<Self> {
        if let Some(path) = &settings.emulator {
            if path.exists() {
                return Ok(Self::new(path.clone(), adb));
            }
            warn!("Configured emulator path does not exist: {}", path.display());
        }

        if let Some(sdk) = settings.sdk_root() {
            let name = if cfg!(windows) { "emulator.exe" } else { "emulator" };
            let candidate = sdk.join("emulator").join(name);
            if candidate.exists() {
                return Ok(Self::new(candidate, adb));
            }
        }

        if let Ok(path) = which::which("emulator") {
            return Ok(Self::new(path, adb));
        }

        Err(Error::emulator(
            "emulator not found. Set android_sdk in the config file or put 'emulator' on your PATH.",
        ))
    }

    fn set_state(&self, state: EmulatorState) {
        debug!("Emulator state: {:?}", state);
        *self.state.lock().expect("emulator state lock poisoned") = state;
    }

    async fn boot_inner(&self, wear: bool, gpu: bool) -> Result<()> {
        if self.state() != EmulatorState::NotRunning {
            return Err(Error::emulator(format!(
                "can't boot an emulator whose state is {:?}",
                self.state()
            )));
        }

        let avd = avd_name(wear);
        let port = avd_port(wear);
        // Let the emulator negotiate hardware acceleration itself unless the
        // sketch opts out of accelerated graphics.
        let gpu_flag = if gpu { "auto" } else { "off" };

        info!("Launching emulator -avd {} -port {} -gpu {}", avd, port, gpu_flag);

        let mut child = Command::new(&self.emulator_path)
            .args(["-avd", avd, "-port", port, "-gpu", gpu_flag])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::emulator(format!("failed to start emulator: {}", e)))?;

        self.set_state(EmulatorState::Booting);

        // Watchdog: a nonzero exit while we are still waiting means the boot
        // failed (a clean zero exit on Windows is normal -- the launcher
        // process detaches from the emulator itself).
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    error!("Emulator process exited with status {:?}", status.code());
                    *state.lock().expect("emulator state lock poisoned") =
                        EmulatorState::NotRunning;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error waiting for emulator process: {}", e);
                    *state.lock().expect("emulator state lock poisoned") =
                        EmulatorState::NotRunning;
                }
            }
        });

        let serial = format!("emulator-{}", port);
        for _ in 0..BOOT_POLL_ATTEMPTS {
            if self.state() == EmulatorState::NotRunning {
                return Err(Error::emulator("emulator exited before finishing boot"));
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
            if let Ok(result) = self
                .adb
                .run_device(&serial, &["shell", "getprop", "dev.bootcomplete"])
                .await
            {
                if result.stdout.trim() == "1" {
                    self.set_state(EmulatorState::Running);
                    info!("Emulator {} finished booting", serial);
                    return Ok(());
                }
            }
        }

        self.set_state(EmulatorState::NotRunning);
        Err(Error::emulator("emulator never finished booting"))
    }
}

/// Controller used when no emulator binary could be located
///
/// Acquisitions that can resolve against an already-running emulator still
/// work; anything that would need a boot fails with a descriptive error.
pub struct UnavailableEmulator;

impl EmulatorController for UnavailableEmulator {
    fn state(&self) -> EmulatorState {
        EmulatorState::NotRunning
    }

    fn boot(&self, _wear: bool, _gpu: bool) -> BoxFuture<'_, Result<()>> {
        async {
            Err(Error::emulator(
                "emulator not found. Set android_sdk in the config file or put 'emulator' on your PATH.",
            ))
        }
        .boxed()
    }
}

impl EmulatorController for SdkEmulator {
    fn state(&self) -> EmulatorState {
        *self.state.lock().expect("emulator state lock poisoned")
    }

    fn boot(&self, wear: bool, gpu: bool) -> BoxFuture<'_, Result<()>> {
        self.boot_inner(wear, gpu).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avd_port_by_form_factor() {
        assert_eq!(avd_port(false), "5566");
        assert_eq!(avd_port(true), "5576");
    }

    #[test]
    fn test_avd_name_by_form_factor() {
        assert_eq!(avd_name(false), "droidrun-phone");
        assert_eq!(avd_name(true), "droidrun-wear");
    }

    #[tokio::test]
    async fn test_boot_fails_for_missing_binary() {
        let emu = SdkEmulator::new(
            PathBuf::from("/nonexistent/emulator"),
            Adb::at(std::path::Path::new("/nonexistent/adb")),
        );
        let err = emu.boot(false, true).await.unwrap_err();
        assert!(matches!(err, Error::Emulator { .. }));
        assert_eq!(emu.state(), EmulatorState::NotRunning);
    }

    #[tokio::test]
    async fn test_boot_rejected_while_not_idle() {
        let emu = SdkEmulator::new(
            PathBuf::from("/nonexistent/emulator"),
            Adb::at(std::path::Path::new("/nonexistent/adb")),
        );
        emu.set_state(EmulatorState::Booting);
        let err = emu.boot(false, true).await.unwrap_err();
        assert!(err.to_string().contains("Booting"));
    }
}
