use super::{AudioBackend, StreamFormat};
use crate::bridge::RenderHandle;
use crate::error::{PetalMixError, Result};
use crate::render::{InputBlock, RenderState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct OfflineState {
    format: Option<StreamFormat>,
    handle: Option<RenderHandle<RenderState>>,
    running: bool,
    fail_starts: u32,
    busy_configures: u32,
    device_error: Option<PetalMixError>,
    input_channels: u16,
    input_denied: bool,
    input_error: Option<PetalMixError>,
    output_latency: Duration,
    input_latency: Duration,
    starts: u32,
    configures: u32,
}

type Shared = Arc<Mutex<OfflineState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, OfflineState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend without a device: audio is rendered when the paired [`OfflineDriver`]
/// asks for it.
///
/// Used for deterministic rendering (tests, offline bounces). The driver can also
/// inject the failures a real device produces: start failures, busy
/// reconfiguration, fatal device errors and denied input.
pub struct OfflineBackend {
    shared: Shared,
}

/// Caller-side handle of an [`OfflineBackend`]. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct OfflineDriver {
    shared: Shared,
}

impl OfflineBackend {
    pub fn new() -> (Self, OfflineDriver) {
        let shared: Shared = Arc::new(Mutex::new(OfflineState::default()));
        (
            Self {
                shared: shared.clone(),
            },
            OfflineDriver { shared },
        )
    }
}

impl AudioBackend for OfflineBackend {
    fn configure(&mut self, format: &StreamFormat) -> Result<()> {
        let mut state = lock(&self.shared);
        state.configures += 1;
        if state.busy_configures > 0 {
            state.busy_configures -= 1;
            return Err(PetalMixError::ReconfigureBusy(
                "offline graph is reconfiguring".into(),
            ));
        }
        state.format = Some(*format);
        state.input_error = if format.enable_input && state.input_denied {
            Some(PetalMixError::InputAccessDenied)
        } else if format.enable_input && state.input_channels == 0 {
            Some(PetalMixError::InputUnavailable("no input channels".into()))
        } else {
            None
        };
        Ok(())
    }

    fn start(&mut self, handle: RenderHandle<RenderState>) -> Result<()> {
        let mut state = lock(&self.shared);
        state.starts += 1;
        if state.format.is_none() {
            return Err(PetalMixError::Engine("Offline backend is not configured".into()));
        }
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(PetalMixError::SystemFatal(
                "offline backend failed to start".into(),
            ));
        }
        state.handle = Some(handle);
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = lock(&self.shared);
        state.running = false;
        state.handle = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    fn input_channels(&self) -> u16 {
        let state = lock(&self.shared);
        match state.format {
            Some(format) if format.enable_input && !state.input_denied => state.input_channels,
            _ => 0,
        }
    }

    fn output_latency(&self) -> Duration {
        lock(&self.shared).output_latency
    }

    fn input_latency(&self) -> Duration {
        lock(&self.shared).input_latency
    }

    fn buffer_duration(&self) -> Duration {
        lock(&self.shared)
            .format
            .map_or(Duration::ZERO, |format| format.block_duration())
    }

    fn take_device_error(&mut self) -> Option<PetalMixError> {
        lock(&self.shared).device_error.take()
    }

    fn take_input_error(&mut self) -> Option<PetalMixError> {
        lock(&self.shared).input_error.take()
    }
}

impl OfflineDriver {
    /// Renders `frames` frames of interleaved output. Silence while stopped.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        self.render_with_input(frames, &[])
    }

    /// Renders `frames` frames, handing `input` (interleaved at the configured input
    /// channel count) to the render state.
    pub fn render_with_input(&self, frames: usize, input: &[f32]) -> Vec<f32> {
        let (handle, channels, input_channels) = {
            let state = lock(&self.shared);
            let channels = state.format.map_or(2, |format| format.channels);
            let input_channels = match state.format {
                Some(format) if format.enable_input && !state.input_denied => state.input_channels,
                _ => 0,
            };
            let handle = if state.running { state.handle.clone() } else { None };
            (handle, channels, input_channels)
        };

        let mut output = vec![0.0; frames * usize::from(channels)];
        if let Some(handle) = handle {
            let input = (input_channels > 0 && !input.is_empty())
                .then(|| InputBlock::new(input, input_channels));
            handle.render(&mut output, input);
        }
        output
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    pub fn format(&self) -> Option<StreamFormat> {
        lock(&self.shared).format
    }

    /// Makes the next `count` starts fail with a fatal error.
    pub fn fail_next_starts(&self, count: u32) {
        lock(&self.shared).fail_starts = count;
    }

    /// Makes the next `count` configure calls report busy.
    pub fn busy_next_configures(&self, count: u32) {
        lock(&self.shared).busy_configures = count;
    }

    /// Reports a fatal device error and stops delivering audio.
    pub fn inject_device_error(&self, error: PetalMixError) {
        let mut state = lock(&self.shared);
        state.device_error = Some(error);
        state.running = false;
    }

    pub fn set_input_channels(&self, channels: u16) {
        lock(&self.shared).input_channels = channels;
    }

    pub fn deny_input(&self, denied: bool) {
        lock(&self.shared).input_denied = denied;
    }

    pub fn set_latencies(&self, output: Duration, input: Duration) {
        let mut state = lock(&self.shared);
        state.output_latency = output;
        state.input_latency = input;
    }

    pub fn start_count(&self) -> u32 {
        lock(&self.shared).starts
    }

    pub fn configure_count(&self) -> u32 {
        lock(&self.shared).configures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(enable_input: bool) -> StreamFormat {
        StreamFormat {
            sample_rate: 48000,
            channels: 2,
            block_size: 256,
            max_frames: 512,
            enable_input,
        }
    }

    #[test]
    fn test_start_requires_configure() {
        let (mut backend, driver) = OfflineBackend::new();
        let (notifier, _) = crossbeam_channel::unbounded();
        let (_graph, state) =
            crate::graph::ChannelGraph::new(crate::source::AudioFormat::stereo(48000), 512, notifier);
        let bridge = crate::bridge::MessageBridge::new(state, crate::bridge::BridgeConfig::default());
        assert!(backend.start(bridge.render_handle()).is_err());
        assert_eq!(driver.start_count(), 1);
        assert!(!driver.is_running());
    }

    #[test]
    fn test_busy_configures_are_counted() {
        let (mut backend, driver) = OfflineBackend::new();
        driver.busy_next_configures(1);
        assert!(matches!(
            backend.configure(&format(false)),
            Err(PetalMixError::ReconfigureBusy(_))
        ));
        assert!(backend.configure(&format(false)).is_ok());
        assert_eq!(driver.configure_count(), 2);
        assert_eq!(driver.format(), Some(format(false)));
    }

    #[test]
    fn test_input_errors_follow_configuration() {
        let (mut backend, driver) = OfflineBackend::new();
        backend.configure(&format(true)).unwrap();
        assert!(matches!(
            backend.take_input_error(),
            Some(PetalMixError::InputUnavailable(_))
        ));
        assert_eq!(backend.input_channels(), 0);

        driver.set_input_channels(2);
        driver.deny_input(true);
        backend.configure(&format(true)).unwrap();
        assert!(matches!(
            backend.take_input_error(),
            Some(PetalMixError::InputAccessDenied)
        ));
        assert_eq!(backend.input_channels(), 0);

        driver.deny_input(false);
        backend.configure(&format(true)).unwrap();
        assert!(backend.take_input_error().is_none());
        assert_eq!(backend.input_channels(), 2);
    }

    #[test]
    fn test_render_is_silent_while_stopped() {
        let (mut backend, driver) = OfflineBackend::new();
        backend.configure(&format(false)).unwrap();
        let output = driver.render(8);
        assert_eq!(output.len(), 16);
        assert!(output.iter().all(|&sample| sample == 0.0));
    }
}
