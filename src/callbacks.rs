//! User callbacks attached to channels and the fixed-capacity table that holds them.

use crate::error::RenderError;
use crate::fixed::FixedList;
use bitflags::bitflags;

/// Maximum number of callbacks on one channel.
pub const MAX_CALLBACKS: usize = 15;

bitflags! {
    /// Role of a registered callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackFlags: u32 {
        /// Transforms the channel's audio and may pull upstream audio.
        const FILTER = 1 << 0;
        /// Observes the channel's audio read-only.
        const RECEIVER = 1 << 1;
        /// Notified once per render cycle before and after rendering.
        const TIMING = 1 << 2;
        /// Routes a copy of the channel's audio elsewhere.
        const SENDER = 1 << 3;
    }
}

impl CallbackFlags {
    /// Roles that require the channel's output to be intercepted.
    pub const INTERPOSING: Self = Self::FILTER.union(Self::RECEIVER).union(Self::SENDER);
}

/// Identifier handed out when a callback is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

/// Render phase reported to timing observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    PreRender,
    PostRender,
}

/// Something that can fill a buffer with audio on request.
///
/// `audio` is interleaved and holds `frames` frames.
pub trait AudioProducer {
    fn produce(
        &mut self,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> std::result::Result<(), RenderError>;
}

/// A processing stage in a channel's filter chain.
///
/// Runs on the render thread: must not block or allocate.
pub trait AudioFilter: Send {
    /// Writes filtered audio into `audio`. Call `upstream.produce` zero or more times to
    /// pull audio from earlier filters and, ultimately, the channel's source.
    fn filter(
        &mut self,
        upstream: &mut dyn AudioProducer,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> std::result::Result<(), RenderError>;
}

/// Read-only listener for a channel's rendered audio.
pub trait AudioReceiver: Send {
    fn receive(&mut self, timestamp: u64, frames: usize, audio: &[f32]);
}

/// Notified once per render cycle with the render clock.
pub trait TimingObserver: Send {
    fn observe(&mut self, phase: RenderPhase, timestamp: u64, frames: usize);
}

/// A registered callback, tagged by role.
pub enum Callback {
    Filter(Box<dyn AudioFilter>),
    Receiver(Box<dyn AudioReceiver>),
    Timing(Box<dyn TimingObserver>),
    Sender(Box<dyn AudioReceiver>),
}

impl Callback {
    pub fn filter(filter: impl AudioFilter + 'static) -> Self {
        Self::Filter(Box::new(filter))
    }

    pub fn receiver(receiver: impl AudioReceiver + 'static) -> Self {
        Self::Receiver(Box::new(receiver))
    }

    pub fn timing(observer: impl TimingObserver + 'static) -> Self {
        Self::Timing(Box::new(observer))
    }

    pub fn sender(sender: impl AudioReceiver + 'static) -> Self {
        Self::Sender(Box::new(sender))
    }

    pub fn flags(&self) -> CallbackFlags {
        match self {
            Self::Filter(_) => CallbackFlags::FILTER,
            Self::Receiver(_) => CallbackFlags::RECEIVER,
            Self::Timing(_) => CallbackFlags::TIMING,
            Self::Sender(_) => CallbackFlags::SENDER,
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callback({:?})", self.flags())
    }
}

#[derive(Debug)]
pub struct CallbackEntry {
    pub id: CallbackId,
    pub callback: Callback,
}

impl CallbackEntry {
    pub fn flags(&self) -> CallbackFlags {
        self.callback.flags()
    }
}

/// Ordered callback registrations of one channel, at most [`MAX_CALLBACKS`].
#[derive(Debug, Default)]
pub struct CallbackTable {
    entries: FixedList<CallbackEntry, MAX_CALLBACKS>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Appends a callback; hands it back if the table is full.
    pub fn add(&mut self, id: CallbackId, callback: Callback) -> std::result::Result<(), Callback> {
        self.entries
            .push(CallbackEntry { id, callback })
            .map_err(|entry| entry.callback)
    }

    /// Removes a callback, shifting later entries down.
    pub fn remove(&mut self, id: CallbackId) -> Option<Callback> {
        self.entries
            .remove_where(|entry| entry.id == id)
            .map(|entry| entry.callback)
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Union of the roles of all entries.
    pub fn flags(&self) -> CallbackFlags {
        self.entries
            .iter()
            .fold(CallbackFlags::empty(), |acc, entry| acc | entry.flags())
    }

    /// Entries whose role intersects `mask`, in registration order. An empty mask
    /// selects every entry.
    pub fn iter(&self, mask: CallbackFlags) -> impl Iterator<Item = &CallbackEntry> {
        self.entries
            .iter()
            .filter(move |entry| mask.is_empty() || entry.flags().intersects(mask))
    }

    pub fn iter_mut(&mut self, mask: CallbackFlags) -> impl Iterator<Item = &mut CallbackEntry> {
        self.entries
            .iter_mut()
            .filter(move |entry| mask.is_empty() || entry.flags().intersects(mask))
    }

    /// Runs the filter chain with `source` as the innermost producer.
    pub fn run_filters(
        &mut self,
        source: &mut dyn AudioProducer,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> std::result::Result<(), RenderError> {
        FilterChain::new(self.entries.as_mut_slots(), source).produce(timestamp, frames, audio)
    }

    /// Hands rendered audio to every receiver and sender.
    pub fn fan_out(&mut self, timestamp: u64, frames: usize, audio: &[f32]) {
        for entry in self.entries.iter_mut() {
            match &mut entry.callback {
                Callback::Receiver(receiver) | Callback::Sender(receiver) => {
                    receiver.receive(timestamp, frames, audio)
                }
                _ => {}
            }
        }
    }

    /// Notifies every timing observer.
    pub fn notify_timing(&mut self, phase: RenderPhase, timestamp: u64, frames: usize) {
        for entry in self.entries.iter_mut() {
            if let Callback::Timing(observer) = &mut entry.callback {
                observer.observe(phase, timestamp, frames);
            }
        }
    }
}

/// Cursor over a filter chain.
///
/// Producing through the chain invokes the last filter in `entries`; that filter's
/// upstream is a chain over the entries before it, and the innermost upstream is the
/// source. Filters F1 then F2 therefore yield `F2(F1(source))`.
pub struct FilterChain<'a, 'p> {
    entries: &'a mut [Option<CallbackEntry>],
    source: &'a mut (dyn AudioProducer + 'p),
}

impl<'a, 'p> FilterChain<'a, 'p> {
    pub fn new(
        entries: &'a mut [Option<CallbackEntry>],
        source: &'a mut (dyn AudioProducer + 'p),
    ) -> Self {
        Self { entries, source }
    }
}

impl AudioProducer for FilterChain<'_, '_> {
    fn produce(
        &mut self,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> std::result::Result<(), RenderError> {
        let stage = self
            .entries
            .iter()
            .rposition(|slot| matches!(slot, Some(entry) if matches!(entry.callback, Callback::Filter(_))));

        let Some(stage) = stage else {
            return self.source.produce(timestamp, frames, audio);
        };

        let (upstream, rest) = self.entries.split_at_mut(stage);
        match rest.first_mut() {
            Some(Some(CallbackEntry {
                callback: Callback::Filter(filter),
                ..
            })) => {
                let mut next = FilterChain {
                    entries: upstream,
                    source: &mut *self.source,
                };
                filter.filter(&mut next, timestamp, frames, audio)
            }
            _ => self.source.produce(timestamp, frames, audio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Constant(f32);

    impl AudioProducer for Constant {
        fn produce(&mut self, _: u64, _: usize, audio: &mut [f32]) -> Result<(), RenderError> {
            audio.fill(self.0);
            Ok(())
        }
    }

    struct Gain(f32, Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl AudioFilter for Gain {
        fn filter(
            &mut self,
            upstream: &mut dyn AudioProducer,
            timestamp: u64,
            frames: usize,
            audio: &mut [f32],
        ) -> Result<(), RenderError> {
            self.1.lock().unwrap().push(self.2);
            upstream.produce(timestamp, frames, audio)?;
            audio.iter_mut().for_each(|s| *s *= self.0);
            Ok(())
        }
    }

    struct Offset(f32);

    impl AudioFilter for Offset {
        fn filter(
            &mut self,
            upstream: &mut dyn AudioProducer,
            timestamp: u64,
            frames: usize,
            audio: &mut [f32],
        ) -> Result<(), RenderError> {
            upstream.produce(timestamp, frames, audio)?;
            audio.iter_mut().for_each(|s| *s += self.0);
            Ok(())
        }
    }

    struct Silence;

    impl AudioReceiver for Silence {
        fn receive(&mut self, _: u64, _: usize, _: &[f32]) {}
    }

    #[test]
    fn test_table_capacity() {
        let mut table = CallbackTable::new();
        for i in 0..MAX_CALLBACKS as u64 {
            assert!(table.add(CallbackId(i), Callback::receiver(Silence)).is_ok());
        }
        assert!(table.add(CallbackId(99), Callback::receiver(Silence)).is_err());
        assert_eq!(table.len(), MAX_CALLBACKS);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut table = CallbackTable::new();
        table.add(CallbackId(1), Callback::receiver(Silence)).unwrap();
        table.add(CallbackId(2), Callback::filter(Offset(1.0))).unwrap();
        table.add(CallbackId(3), Callback::receiver(Silence)).unwrap();
        assert!(table.remove(CallbackId(2)).is_some());
        assert!(table.remove(CallbackId(2)).is_none());
        let ids: Vec<_> = table.iter(CallbackFlags::empty()).map(|e| e.id).collect();
        assert_eq!(ids, vec![CallbackId(1), CallbackId(3)]);
        assert_eq!(table.flags(), CallbackFlags::RECEIVER);
    }

    #[test]
    fn test_filter_chain_composes_last_added_outermost() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut table = CallbackTable::new();
        // F1 doubles, F2 adds one: F2(F1(0.5)) = 2.0, F1(F2(0.5)) = 3.0.
        table.add(CallbackId(1), Callback::filter(Gain(2.0, order.clone(), "f1"))).unwrap();
        table.add(CallbackId(2), Callback::receiver(Silence)).unwrap();
        table.add(CallbackId(3), Callback::filter(Offset(1.0))).unwrap();

        let mut audio = [0.0f32; 8];
        table.run_filters(&mut Constant(0.5), 0, 4, &mut audio).unwrap();
        assert!(audio.iter().all(|s| (*s - 2.0).abs() < 1e-6));
        assert_eq!(*order.lock().unwrap(), vec!["f1"]);
    }

    #[test]
    fn test_filter_chain_without_filters_is_source() {
        let mut table = CallbackTable::new();
        table.add(CallbackId(1), Callback::receiver(Silence)).unwrap();
        let mut audio = [0.0f32; 4];
        table.run_filters(&mut Constant(0.25), 0, 2, &mut audio).unwrap();
        assert_eq!(audio, [0.25; 4]);
    }
}
