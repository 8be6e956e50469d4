//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    // ─────────────────────────────────────────────────────────────
    // Bridge-Tool Errors
    // ─────────────────────────────────────────────────────────────
    #[error("adb not found. Set android_sdk in the config file or put 'adb' on your PATH.")]
    AdbNotFound,

    #[error("Tool invocation failed: {message}")]
    Tool { message: String },

    // ─────────────────────────────────────────────────────────────
    // Device/Log Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Unrecognized log line: {line}")]
    LogParse { line: String },

    #[error("Lost connection with device {id}")]
    DeviceLost { id: String },

    #[error("Could not install the sketch: {message}")]
    Install { message: String },

    // ─────────────────────────────────────────────────────────────
    // Acquisition Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device acquisition was cancelled")]
    AcquisitionCancelled,

    #[error("No device became available: {message}")]
    AcquisitionFailed { message: String },

    #[error("Emulator error: {message}")]
    Emulator { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
        }
    }

    pub fn log_parse(line: impl Into<String>) -> Self {
        Self::LogParse { line: line.into() }
    }

    pub fn device_lost(id: impl Into<String>) -> Self {
        Self::DeviceLost { id: id.into() }
    }

    pub fn install(message: impl Into<String>) -> Self {
        Self::Install {
            message: message.into(),
        }
    }

    pub fn acquisition(message: impl Into<String>) -> Self {
        Self::AcquisitionFailed {
            message: message.into(),
        }
    }

    pub fn emulator(message: impl Into<String>) -> Self {
        Self::Emulator {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors are absorbed and logged by the component that hit
    /// them; one bad device or one garbled line never disables the registry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Tool { .. }
                | Error::LogParse { .. }
                | Error::DeviceLost { .. }
                | Error::Install { .. }
                | Error::AcquisitionCancelled
                | Error::AcquisitionFailed { .. }
                | Error::Emulator { .. }
        )
    }

    /// Check if this error should abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AdbNotFound | Error::Config { .. })
    }
}
