//! Audio I/O backends.
//!
//! A backend owns the device side of the engine: it opens streams in the
//! configured format and, once started, calls
//! [`RenderHandle::render`](crate::bridge::RenderHandle) from its audio callback.
//! [`CpalBackend`] drives real hardware through `cpal`; [`OfflineBackend`] is
//! driven by the caller and is what the tests use.

mod device;
mod diagnostics;
mod offline;
mod session;

pub use device::CpalBackend;
pub use diagnostics::{DiagnosticLimiter, LogDecision};
pub use offline::{OfflineBackend, OfflineDriver};
pub use session::{SessionInfo, SessionState};

use crate::bridge::RenderHandle;
use crate::error::{PetalMixError, Result};
use crate::render::RenderState;
use std::time::Duration;

/// Stream parameters requested from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred frames per device callback.
    pub block_size: usize,
    /// Largest number of frames the render state processes at once.
    pub max_frames: usize,
    pub enable_input: bool,
}

impl StreamFormat {
    /// Duration of one device callback.
    pub fn block_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.block_size as f64 / f64::from(self.sample_rate))
    }
}

/// Device side of the engine.
pub trait AudioBackend: Send {
    /// Prepares streams in `format`. May fail with
    /// [`PetalMixError::ReconfigureBusy`], which callers retry.
    fn configure(&mut self, format: &StreamFormat) -> Result<()>;

    /// Starts calling `handle` from the audio callback.
    fn start(&mut self, handle: RenderHandle<RenderState>) -> Result<()>;

    /// Stops the audio callback. Idempotent.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Input channels delivered to the render state; zero without input.
    fn input_channels(&self) -> u16;

    fn output_latency(&self) -> Duration;

    fn input_latency(&self) -> Duration;

    fn buffer_duration(&self) -> Duration;

    /// Fatal device error reported since the last call, if any.
    fn take_device_error(&mut self) -> Option<PetalMixError>;

    /// Why input is unavailable, reported once after configure or start.
    fn take_input_error(&mut self) -> Option<PetalMixError> {
        None
    }
}

/// Runs `op`, retrying [`PetalMixError::ReconfigureBusy`] failures up to `attempts`
/// times in total with `backoff` between them. Other errors return immediately.
pub fn retry_reconfigure<T>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(PetalMixError::ReconfigureBusy(reason)) if attempt < attempts => {
                log::debug!(
                    "Reconfigure busy ({}), retrying {}/{} in {:?}",
                    reason,
                    attempt,
                    attempts,
                    backoff
                );
                std::thread::sleep(backoff);
                attempt += 1;
            }
            result => return result,
        }
    }
}
