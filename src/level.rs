//! Running peak and mean level metering.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Levels in decibels relative to full scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub average_db: f32,
    pub peak_db: f32,
}

impl Levels {
    pub const SILENT: Levels = Levels {
        average_db: f32::NEG_INFINITY,
        peak_db: f32::NEG_INFINITY,
    };
}

/// Accumulates peak (max-hold) and mean power of the audio fed to it.
///
/// Fed from the render thread, read from control threads. Both stored values are
/// squared magnitudes, so [`read`](Self::read) converts with `10·log10` and a constant
/// input of value `V` reads as `20·log10(V)`.
///
/// A reset is a request: [`request_reset`](Self::request_reset) sets a flag and the
/// next [`feed`](Self::feed) clears the accumulators before using the new block.
#[derive(Debug)]
pub struct LevelMonitor {
    enabled: AtomicBool,
    reset: AtomicBool,
    peak: AtomicU32,
    mean: AtomicU32,
    blocks: AtomicU64,
}

impl Default for LevelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelMonitor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            peak: AtomicU32::new(0.0f32.to_bits()),
            mean: AtomicU32::new(0.0f32.to_bits()),
            blocks: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Number of blocks accumulated since the last reset.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Accumulates one block. Does nothing while disabled or for an empty block.
    pub fn feed(&self, buffer: &[f32]) {
        if !self.is_enabled() {
            return;
        }

        if self.reset.swap(false, Ordering::AcqRel) {
            self.peak.store(0.0f32.to_bits(), Ordering::Relaxed);
            self.mean.store(0.0f32.to_bits(), Ordering::Relaxed);
            self.blocks.store(0, Ordering::Relaxed);
        }

        if buffer.is_empty() {
            return;
        }

        let (block_peak, sum) = buffer.iter().fold((0.0f32, 0.0f64), |(peak, sum), s| {
            let power = s * s;
            (peak.max(power), sum + power as f64)
        });
        let block_mean = (sum / buffer.len() as f64) as f32;

        let peak = f32::from_bits(self.peak.load(Ordering::Relaxed));
        if block_peak > peak {
            self.peak.store(block_peak.to_bits(), Ordering::Relaxed);
        }

        let blocks = self.blocks.load(Ordering::Relaxed) + 1;
        let mean = f32::from_bits(self.mean.load(Ordering::Relaxed));
        let mean = mean + (block_mean - mean) / blocks as f32;
        self.mean.store(mean.to_bits(), Ordering::Relaxed);
        self.blocks.store(blocks, Ordering::Relaxed);
    }

    pub fn read(&self) -> Levels {
        let peak = f32::from_bits(self.peak.load(Ordering::Relaxed));
        let mean = f32::from_bits(self.mean.load(Ordering::Relaxed));
        Levels {
            average_db: 10.0 * mean.log10(),
            peak_db: 10.0 * peak.log10(),
        }
    }
}
