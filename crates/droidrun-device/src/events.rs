//! Device lifecycle events
//!
//! Each device handle fans these out on a broadcast channel; subscribers
//! drain their own receiver, so no listener can stall the log stream worker.

/// Notification pushed by a device handle to its subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The tracked sketch stopped (killed, crashed, or the device went away).
    ///
    /// Delivered at-least-once; receivers must treat repeats as a no-op.
    Stopped,

    /// The tracked sketch crashed; `trace` holds the accumulated stack-trace
    /// lines in arrival order.
    Crashed { pid: u32, trace: Vec<String> },
}
