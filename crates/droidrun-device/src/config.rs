//! User settings for locating the Android tooling
//!
//! Loaded from `<config-dir>/droidrun/config.toml`. Every field is optional;
//! a missing file just means defaults (probe the environment and PATH).

use std::path::{Path, PathBuf};

use droidrun_core::prelude::*;
use serde::Deserialize;

/// Tool location overrides
///
/// ```toml
/// # ~/.config/droidrun/config.toml
/// android_sdk = "/opt/android-sdk"
/// adb = "/opt/android-sdk/platform-tools/adb"
/// emulator = "/opt/android-sdk/emulator/emulator"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Android SDK root; adb and emulator are resolved relative to it
    #[serde(default)]
    pub android_sdk: Option<PathBuf>,

    /// Explicit path to the adb binary
    #[serde(default)]
    pub adb: Option<PathBuf>,

    /// Explicit path to the emulator binary
    #[serde(default)]
    pub emulator: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default config path
    pub fn load() -> Result<Self> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// SDK root from the config file or the conventional environment variables
    pub fn sdk_root(&self) -> Option<PathBuf> {
        if let Some(sdk) = &self.android_sdk {
            return Some(sdk.clone());
        }
        std::env::var_os("ANDROID_HOME")
            .or_else(|| std::env::var_os("ANDROID_SDK_ROOT"))
            .map(PathBuf::from)
    }
}

/// Path of the user config file, if a config directory exists
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("droidrun").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "android_sdk = \"/opt/sdk\"\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.android_sdk, Some(PathBuf::from("/opt/sdk")));
        assert!(settings.adb.is_none());
        assert!(settings.emulator.is_none());
    }

    #[test]
    fn test_load_from_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "android_sdk = [not toml").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_sdk_root_prefers_config_value() {
        std::env::set_var("ANDROID_HOME", "/env/sdk");
        let settings = Settings {
            android_sdk: Some(PathBuf::from("/cfg/sdk")),
            ..Default::default()
        };
        assert_eq!(settings.sdk_root(), Some(PathBuf::from("/cfg/sdk")));
        std::env::remove_var("ANDROID_HOME");
    }

    #[test]
    #[serial]
    fn test_sdk_root_falls_back_to_env() {
        std::env::remove_var("ANDROID_HOME");
        std::env::set_var("ANDROID_SDK_ROOT", "/env/sdk");
        let settings = Settings::default();
        assert_eq!(settings.sdk_root(), Some(PathBuf::from("/env/sdk")));
        std::env::remove_var("ANDROID_SDK_ROOT");
    }
}
