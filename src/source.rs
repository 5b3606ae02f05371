//! Leaf audio sources and their property snapshots.

use crate::error::RenderError;
use crossbeam_channel::Sender;

/// Sample rate and interleaved channel count of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2)
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }
}

/// Mixing properties a source reports about itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProperties {
    pub playing: bool,
    pub volume: f32,
    pub pan: f32,
    pub muted: bool,
}

impl Default for SourceProperties {
    fn default() -> Self {
        Self {
            playing: true,
            volume: 1.0,
            pan: 0.0,
            muted: false,
        }
    }
}

/// Identifier the engine assigns to each attached source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Handle a source uses to tell the engine its properties changed.
///
/// The engine re-reads [`AudioSource::properties`] on its polling thread, so
/// notifying is cheap and may be done from any thread.
#[derive(Debug, Clone)]
pub struct PropertyNotifier {
    id: SourceId,
    sender: Sender<SourceId>,
}

impl PropertyNotifier {
    pub(crate) fn new(id: SourceId, sender: Sender<SourceId>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn notify(&self) {
        if self.sender.send(self.id).is_err() {
            log::debug!("Property change for {:?} dropped: engine is gone", self.id);
        }
    }
}

/// A leaf of the mix tree.
///
/// [`render`](Self::render) runs on the render thread and must not block or
/// allocate. The other methods are called from control threads.
pub trait AudioSource: Send + Sync {
    /// Fills `audio` (interleaved, `frames` frames at [`format`](Self::format)'s
    /// channel count) with samples for the given render timestamp. The buffer has
    /// already been silenced.
    fn render(
        &self,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> std::result::Result<(), RenderError>;

    /// Stream format, or `None` to render at the owning group's format.
    fn format(&self) -> Option<AudioFormat> {
        None
    }

    /// Current mixing properties, or `None` to use the defaults.
    fn properties(&self) -> Option<SourceProperties> {
        None
    }

    /// Called when the source is added to the graph.
    fn attach(&self, _notifier: PropertyNotifier) {}

    /// Called after the source has been removed from the graph.
    fn detach(&self) {}
}
