//! Helpers for tests in this crate and downstream crates
//!
//! Enabled with the `test-helpers` feature (or automatically under
//! `cfg(test)`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::adb::Adb;
use crate::device::Device;

/// A device handle that is not attached to any registry or subprocess
///
/// The classifier and lifecycle state machine work as usual; tool commands
/// fail with recoverable errors because the adb path does not exist.
pub fn detached_device(id: &str, features: &str) -> Arc<Device> {
    Arc::new(Device::new(
        id.to_string(),
        format!("Test Device [{}]", id),
        features.to_string(),
        Adb::at(Path::new("/nonexistent/adb")),
        Arc::new(Mutex::new(HashMap::new())),
    ))
}
