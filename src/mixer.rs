//! Per-group mixer resource.
//!
//! Each group owns one [`MixerNode`] with a parameter set per input bus. Parameters
//! are single atomic stores: control threads write them directly and the render
//! thread reads them while mixing, so volume/pan/enable changes never go through the
//! message bridge.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Maximum number of children (input buses) in one group.
pub const MAX_CHANNELS: usize = 100;

/// Largest pan magnitude written as a mixer parameter. Hard ±1.0 is nudged inward.
pub const PAN_LIMIT: f32 = 0.999;

#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct BusParams {
    volume: AtomicF32,
    pan: AtomicF32,
    enabled: AtomicBool,
}

impl BusParams {
    fn new() -> Self {
        Self {
            volume: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            enabled: AtomicBool::new(false),
        }
    }

    fn copy_from(&self, other: &BusParams) {
        self.volume.store(other.volume.load());
        self.pan.store(other.pan.load());
        self.enabled
            .store(other.enabled.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.volume.store(1.0);
        self.pan.store(0.0);
        self.enabled.store(false, Ordering::Relaxed);
    }
}

/// Gain pair applied to one bus when mixing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusGains {
    pub left: f32,
    pub right: f32,
}

#[derive(Debug)]
pub struct MixerNode {
    buses: Box<[BusParams]>,
    bus_count: AtomicUsize,
}

impl Default for MixerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MixerNode {
    pub fn new() -> Self {
        Self {
            buses: (0..MAX_CHANNELS).map(|_| BusParams::new()).collect(),
            bus_count: AtomicUsize::new(0),
        }
    }

    pub fn bus_count(&self) -> usize {
        self.bus_count.load(Ordering::Acquire)
    }

    pub fn set_bus_count(&self, count: usize) {
        self.bus_count
            .store(count.min(MAX_CHANNELS), Ordering::Release);
    }

    pub fn volume(&self, bus: usize) -> f32 {
        self.buses.get(bus).map_or(0.0, |params| params.volume.load())
    }

    pub fn set_volume(&self, bus: usize, volume: f32) {
        if let Some(params) = self.buses.get(bus) {
            params.volume.store(volume.clamp(0.0, 1.0));
        }
    }

    pub fn pan(&self, bus: usize) -> f32 {
        self.buses.get(bus).map_or(0.0, |params| params.pan.load())
    }

    /// Stores the pan parameter, clamped to `[-1, 1]` with hard ±1.0 nudged to
    /// ±[`PAN_LIMIT`].
    pub fn set_pan(&self, bus: usize, pan: f32) {
        if let Some(params) = self.buses.get(bus) {
            params.pan.store(nudge_pan(pan));
        }
    }

    pub fn is_enabled(&self, bus: usize) -> bool {
        self.buses
            .get(bus)
            .is_some_and(|params| params.enabled.load(Ordering::Acquire))
    }

    pub fn set_enabled(&self, bus: usize, enabled: bool) {
        if let Some(params) = self.buses.get(bus) {
            params.enabled.store(enabled, Ordering::Release);
        }
    }

    /// Removes bus `index`, shifting the parameters of later buses down by one.
    ///
    /// Called from the render thread together with the matching child removal so
    /// that parameters stay aligned with their children.
    pub fn remove_bus(&self, index: usize) {
        let count = self.bus_count();
        if index >= MAX_CHANNELS {
            return;
        }
        let last = count.max(index + 1).min(MAX_CHANNELS);
        for bus in index..last.saturating_sub(1) {
            self.buses[bus].copy_from(&self.buses[bus + 1]);
        }
        self.buses[last - 1].reset();
        if count > index {
            self.set_bus_count(count - 1);
        }
    }

    /// Gains for `bus` in a group with `channels` output channels.
    ///
    /// Stereo uses a two-term balance split, `left = v·min(1, 1 − pan)` and
    /// `right = v·min(1, 1 + pan)`, so the centre is unity on both sides. Other channel
    /// counts apply the volume flat.
    pub fn gains(&self, bus: usize, channels: usize) -> BusGains {
        let volume = self.volume(bus);
        if channels != 2 {
            return BusGains {
                left: volume,
                right: volume,
            };
        }
        let pan = self.pan(bus);
        BusGains {
            left: volume * (1.0 - pan).min(1.0),
            right: volume * (1.0 + pan).min(1.0),
        }
    }
}

pub(crate) fn nudge_pan(pan: f32) -> f32 {
    let pan = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    if pan >= 1.0 {
        PAN_LIMIT
    } else if pan <= -1.0 {
        -PAN_LIMIT
    } else {
        pan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_is_nudged_at_the_edges() {
        let mixer = MixerNode::new();
        mixer.set_pan(0, 1.0);
        assert_eq!(mixer.pan(0), PAN_LIMIT);
        mixer.set_pan(0, -4.0);
        assert_eq!(mixer.pan(0), -PAN_LIMIT);
        mixer.set_pan(0, 0.25);
        assert_eq!(mixer.pan(0), 0.25);
    }

    #[test]
    fn test_stereo_gains() {
        let mixer = MixerNode::new();
        mixer.set_volume(0, 0.5);
        let centre = mixer.gains(0, 2);
        assert_eq!(centre, BusGains { left: 0.5, right: 0.5 });

        mixer.set_pan(0, 0.5);
        let right = mixer.gains(0, 2);
        assert!((right.left - 0.25).abs() < 1e-6);
        assert_eq!(right.right, 0.5);

        let mono = mixer.gains(0, 1);
        assert_eq!(mono, BusGains { left: 0.5, right: 0.5 });
    }

    #[test]
    fn test_remove_bus_shifts_parameters() {
        let mixer = MixerNode::new();
        for bus in 0..3 {
            mixer.set_volume(bus, 0.1 * (bus + 1) as f32);
            mixer.set_enabled(bus, true);
        }
        mixer.set_bus_count(3);

        mixer.remove_bus(0);
        assert_eq!(mixer.bus_count(), 2);
        assert!((mixer.volume(0) - 0.2).abs() < 1e-6);
        assert!((mixer.volume(1) - 0.3).abs() < 1e-6);
        assert!(!mixer.is_enabled(2));
        assert_eq!(mixer.volume(2), 1.0);
    }

    #[test]
    fn test_out_of_range_bus_is_ignored() {
        let mixer = MixerNode::new();
        mixer.set_volume(MAX_CHANNELS, 0.3);
        assert_eq!(mixer.volume(MAX_CHANNELS), 0.0);
        assert!(!mixer.is_enabled(MAX_CHANNELS));
    }
}
