//! Error types for PetalMix

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetalMixError {
    /// A fixed-capacity table or group is full. Non-fatal: the operation is rejected.
    #[error("{what} is full (capacity {capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    /// A call into the audio graph or device failed and was not applied.
    #[error("Hardware configuration error: {0}")]
    HardwareConfiguration(String),

    /// The graph cannot be reconfigured right now; callers retry with backoff.
    #[error("Graph busy, cannot reconfigure now: {0}")]
    ReconfigureBusy(String),

    /// The engine failed to initialize or start and recovery did not succeed.
    #[error("System fatal error: {0}")]
    SystemFatal(String),

    #[error("Timed out waiting for the render thread")]
    MessageTimeout,

    #[error("Audio input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Audio input access denied")]
    InputAccessDenied,

    #[error("Ring buffer error: {0}")]
    RingBuffer(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl PetalMixError {
    /// Returns true for errors that are absorbed with logging rather than surfaced
    /// to the application.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::SystemFatal(_) | Self::InputAccessDenied | Self::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PetalMixError>;

/// Status reported by sources and filters on the render thread.
///
/// Carries no payload so that reporting it never allocates.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderError {
    #[error("No audio available")]
    Unavailable,

    #[error("Render failed")]
    Failed,
}
