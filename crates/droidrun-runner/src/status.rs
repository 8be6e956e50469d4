//! Status reporting surface
//!
//! Runner failures are reported, never thrown: a long-running interactive
//! tool keeps going after a bad launch. Implementations must be non-blocking
//! -- notifications arrive synchronously from event-drain tasks.

/// Where the runner reports progress and failures
pub trait RunnerStatus: Send + Sync {
    /// Progress message
    fn notice(&self, message: &str);

    /// Human-readable failure report
    fn error(&self, message: &str);

    /// The sketch stopped running on the device
    fn halt(&self);

    /// Whether the user aborted; checked between acquisition polls
    fn is_halted(&self) -> bool;
}
