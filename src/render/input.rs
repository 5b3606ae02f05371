//! Routing of hardware input audio to input callbacks.
//!
//! Input callbacks are grouped by the subset of input channels they want. Each
//! distinct selection gets an [`InputEntry`] with its own callback table and
//! scratch buffer; per cycle the selected channels are extracted from the
//! interleaved hardware input, run through the entry's filters and fanned out to its
//! receivers.

use crate::callbacks::{AudioProducer, CallbackId, CallbackTable};
use crate::error::RenderError;
use crate::fixed::FixedList;
use crate::level::LevelMonitor;
use std::sync::Arc;

/// Maximum number of distinct input channel selections.
pub const MAX_INPUT_SELECTIONS: usize = 15;

/// Interleaved input audio handed to one render cycle.
#[derive(Debug, Clone, Copy)]
pub struct InputBlock<'a> {
    pub samples: &'a [f32],
    pub channels: u16,
}

impl<'a> InputBlock<'a> {
    pub fn new(samples: &'a [f32], channels: u16) -> Self {
        Self { samples, channels }
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / usize::from(self.channels)
        }
    }

    /// Frames `offset..offset + frames`, clamped to what is available.
    pub(crate) fn slice(&self, offset: usize, frames: usize) -> InputBlock<'a> {
        let channels = usize::from(self.channels);
        let start = (offset * channels).min(self.samples.len());
        let end = ((offset + frames) * channels).min(self.samples.len());
        InputBlock {
            samples: &self.samples[start..end],
            channels: self.channels,
        }
    }
}

/// Input callbacks registered for one channel selection.
#[derive(Debug)]
pub struct InputEntry {
    selection: Box<[u16]>,
    callbacks: CallbackTable,
    scratch: Vec<f32>,
}

impl InputEntry {
    pub fn new(selection: &[u16], max_frames: usize) -> Self {
        Self {
            selection: selection.into(),
            callbacks: CallbackTable::new(),
            scratch: vec![0.0; selection.len().max(1) * max_frames],
        }
    }

    pub fn selection(&self) -> &[u16] {
        &self.selection
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackTable {
        &mut self.callbacks
    }
}

struct Extract<'a> {
    input: InputBlock<'a>,
    selection: &'a [u16],
}

impl AudioProducer for Extract<'_> {
    fn produce(&mut self, _timestamp: u64, frames: usize, audio: &mut [f32]) -> Result<(), RenderError> {
        let width = self.selection.len();
        let channels = usize::from(self.input.channels);
        audio.fill(0.0);
        let available = self.input.frames().min(frames);
        for frame in 0..available {
            let src = &self.input.samples[frame * channels..(frame + 1) * channels];
            let dst = &mut audio[frame * width..(frame + 1) * width];
            for (sample, &channel) in dst.iter_mut().zip(self.selection.iter()) {
                *sample = src.get(usize::from(channel)).copied().unwrap_or(0.0);
            }
        }
        Ok(())
    }
}

/// Render-side input routing table.
#[derive(Debug)]
pub struct InputRouter {
    entries: FixedList<InputEntry, MAX_INPUT_SELECTIONS>,
    level: Arc<LevelMonitor>,
}

impl InputRouter {
    pub fn new(level: Arc<LevelMonitor>) -> Self {
        Self {
            entries: FixedList::new(),
            level,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_mut(&mut self, selection: &[u16]) -> Option<&mut InputEntry> {
        self.entries
            .iter_mut()
            .find(|entry| &*entry.selection == selection)
    }

    /// Adds a new selection entry; hands it back if the table is full.
    pub fn push(&mut self, entry: InputEntry) -> Result<(), InputEntry> {
        self.entries.push(entry)
    }

    /// Removes the entry for `selection` once it has no callbacks left.
    pub fn remove_empty(&mut self, selection: &[u16]) -> Option<InputEntry> {
        self.entries
            .remove_where(|entry| &*entry.selection == selection && entry.callbacks.is_empty())
    }

    pub fn contains_callback(&self, id: CallbackId) -> bool {
        self.entries.iter().any(|entry| entry.callbacks.contains(id))
    }

    pub fn is_consistent(&self) -> bool {
        self.entries.is_dense()
    }

    /// Routes one cycle of input. Without input channels nothing is called.
    pub fn process(&mut self, input: InputBlock<'_>, frames: usize, timestamp: u64) {
        if input.channels == 0 || input.samples.is_empty() {
            return;
        }
        let available = input.frames().min(frames);
        self.level
            .feed(&input.samples[..available * usize::from(input.channels)]);

        for entry in self.entries.iter_mut() {
            let InputEntry {
                selection,
                callbacks,
                scratch,
            } = entry;
            let samples = frames * selection.len();
            if samples > scratch.len() {
                continue;
            }
            let audio = &mut scratch[..samples];
            let mut extract = Extract {
                input,
                selection: &**selection,
            };
            if callbacks
                .run_filters(&mut extract, timestamp, frames, audio)
                .is_err()
            {
                audio.fill(0.0);
            }
            callbacks.fan_out(timestamp, frames, audio);
        }
    }
}
