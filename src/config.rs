//! Configuration for PetalMix

use crate::error::{PetalMixError, Result};
use std::time::Duration;

/// Configuration descriptor for a PetalMix engine
#[derive(Debug, Clone)]
pub struct PetalMixDesc {
    /// Sample rate of the mixing graph
    pub sample_rate: u32,
    /// Preferred number of frames per device callback
    pub block_size: usize,
    /// Largest number of frames rendered in one pass; larger requests are sliced
    pub max_frames_per_slice: usize,
    /// Number of output channels (typically 2 for stereo)
    pub channels: u16,
    /// Open the input device and route input audio to input callbacks
    pub enable_input: bool,
    /// Number of messages each bridge ring can hold
    pub message_capacity: usize,
    /// How long `send_sync` waits for the render thread before giving up
    pub sync_timeout: Duration,
    /// Sleep between polls while a synchronous exchange is waiting
    pub sync_poll_interval: Duration,
    /// Polling helper interval while no response is outstanding
    pub idle_poll_interval: Duration,
    /// Polling helper interval while responses are outstanding
    pub active_poll_interval: Duration,
    /// Attempts for graph calls that report "cannot reconfigure now"
    pub reconfigure_attempts: u32,
    /// Delay between reconfigure attempts
    pub reconfigure_backoff: Duration,
    /// Automatic recovery attempts after a fatal start failure
    pub recovery_attempts: u32,
    /// Wait between teardown and rebuild during recovery
    pub recovery_delay: Duration,
}

impl Default for PetalMixDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            max_frames_per_slice: 4096,
            channels: 2,
            enable_input: false,
            message_capacity: 256,
            sync_timeout: Duration::from_secs(1),
            sync_poll_interval: Duration::from_micros(500),
            idle_poll_interval: Duration::from_millis(100),
            active_poll_interval: Duration::from_millis(10),
            reconfigure_attempts: 6,
            reconfigure_backoff: Duration::from_millis(10),
            recovery_attempts: 3,
            recovery_delay: Duration::from_millis(100),
        }
    }
}

impl PetalMixDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn max_frames_per_slice(mut self, frames: usize) -> Self {
        self.max_frames_per_slice = frames;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn enable_input(mut self, enable: bool) -> Self {
        self.enable_input = enable;
        self
    }

    pub fn message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn poll_intervals(mut self, idle: Duration, active: Duration) -> Self {
        self.idle_poll_interval = idle;
        self.active_poll_interval = active;
        self
    }

    pub fn recovery(mut self, attempts: u32, delay: Duration) -> Self {
        self.recovery_attempts = attempts;
        self.recovery_delay = delay;
        self
    }

    /// Checks the descriptor for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalMixError::Configuration(
                "Sample rate must be greater than 0".to_string(),
            ));
        }
        if self.channels == 0 {
            return Err(PetalMixError::Configuration(
                "Channel count must be greater than 0".to_string(),
            ));
        }
        if self.max_frames_per_slice == 0 || self.block_size == 0 {
            return Err(PetalMixError::Configuration(
                "Block size and slice size must be greater than 0".to_string(),
            ));
        }
        if self.message_capacity < 2 {
            return Err(PetalMixError::Configuration(format!(
                "Message capacity {} is too small",
                self.message_capacity
            )));
        }
        Ok(())
    }

    pub(crate) fn bridge_config(&self) -> crate::bridge::BridgeConfig {
        crate::bridge::BridgeConfig {
            capacity: self.message_capacity,
            sync_timeout: self.sync_timeout,
            sync_poll_interval: self.sync_poll_interval,
            idle_poll_interval: self.idle_poll_interval,
            active_poll_interval: self.active_poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc_is_valid() {
        let desc = PetalMixDesc::default();
        assert!(desc.validate().is_ok());
        assert_eq!(desc.sync_timeout, Duration::from_secs(1));
        assert_eq!(desc.reconfigure_attempts, 6);
        assert_eq!(desc.recovery_attempts, 3);
    }

    #[test]
    fn test_invalid_desc() {
        assert!(PetalMixDesc::new().sample_rate(0).validate().is_err());
        assert!(PetalMixDesc::new().channels(0).validate().is_err());
        assert!(PetalMixDesc::new().message_capacity(1).validate().is_err());
    }
}
