//! # droidrun-device - Device Discovery and Lifecycle Tracking
//!
//! Talks to attached Android devices and emulators through the bridge tool
//! (`adb`). Depends on [`droidrun_core`] for the log grammar and error
//! handling.
//!
//! ## Public API
//!
//! ### Bridge Tool (`adb`)
//! - [`Adb`] - Resolved adb binary; one-shot commands and the logcat stream
//! - [`ProcessResult`] - Captured output of a finished invocation
//!
//! ### Devices (`device`, `events`, `registry`)
//! - [`Device`] - One attached device: log stream, pid tracking, crash
//!   detection, install/launch commands
//! - [`DeviceEvent`] - Stop/crash notifications broadcast per device
//! - [`DeviceRegistry`] - Catalog of known devices; discovery refresh and the
//!   serialized acquisition queue
//! - [`PendingAcquisition`] - Cancellable in-flight device request
//!
//! ### Emulators (`emulator`)
//! - [`EmulatorController`] - Boot-on-demand seam consumed by the registry
//! - [`SdkEmulator`] - Implementation over the SDK `emulator` binary
//!
//! ### Configuration (`config`)
//! - [`Settings`] - Tool location overrides from the user config file

pub mod adb;
pub mod config;
pub mod device;
pub mod emulator;
pub mod events;
pub mod registry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use adb::{Adb, ProcessResult};
pub use config::Settings;
pub use device::Device;
pub use emulator::{
    avd_name, avd_port, EmulatorController, EmulatorState, SdkEmulator, UnavailableEmulator,
};
pub use events::DeviceEvent;
pub use registry::{DeviceRegistry, PendingAcquisition};
