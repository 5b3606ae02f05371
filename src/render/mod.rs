//! Render-side mix tree and the per-cycle render algorithm.
//!
//! Everything here runs on the render thread, inside
//! [`RenderHandle::render`](crate::bridge::RenderHandle): no allocation, no
//! waiting. The tree is only reshaped by render tasks delivered through the
//! message bridge, which run between cycles, so a cycle always sees complete
//! groups.
//!
//! One cycle, per slice of at most `max_frames_per_slice` frames:
//!
//! 1. timing observers on the root channel ([`RenderPhase::PreRender`])
//! 2. input routing
//! 3. the root channel renders the whole tree into the output
//! 4. timing observers ([`RenderPhase::PostRender`])
//!
//! and after the last slice the bridge is drained exactly once.

mod input;
mod mapper;

pub use input::{InputBlock, InputEntry, InputRouter, MAX_INPUT_SELECTIONS};
pub use mapper::ChannelMapper;

use crate::bridge::RenderHandle;
use crate::callbacks::{AudioProducer, CallbackEntry, CallbackId, CallbackTable, RenderPhase};
use crate::error::RenderError;
use crate::fixed::FixedList;
use crate::level::LevelMonitor;
use crate::mixer::{MAX_CHANNELS, MixerNode};
use crate::source::AudioSource;
use std::sync::Arc;

/// Identifier of a channel group. [`GroupId::TOP`] is the group under the root channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const TOP: GroupId = GroupId(0);
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Position of a channel in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The channel wrapping the top group.
    Root,
    Child { group: GroupId, index: usize },
}

/// How a channel's output reaches its parent's mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStyle {
    /// Not connected; renders silence.
    #[default]
    Unconnected,
    /// Producer output goes straight to the mixer.
    Direct,
    /// Output is intercepted to run filters, receivers, senders or channel mapping.
    Interposed,
}

/// Device latencies in frames, as seen by the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub output_latency_frames: u64,
    pub input_latency_frames: u64,
}

/// What a channel produces.
pub enum ChannelNode {
    Leaf(Arc<dyn AudioSource>),
    Group(Box<RenderGroup>),
}

impl std::fmt::Debug for ChannelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(_) => f.write_str("Leaf"),
            Self::Group(group) => f.debug_tuple("Group").field(&group.id).finish(),
        }
    }
}

/// A mixer input: a leaf source or a nested group, with its callbacks.
#[derive(Debug)]
pub struct RenderChannel {
    node: ChannelNode,
    callbacks: CallbackTable,
    connection: ConnectionStyle,
    timestamp: u64,
    mapper: Option<ChannelMapper>,
}

impl RenderChannel {
    pub fn leaf(source: Arc<dyn AudioSource>, mapper: Option<ChannelMapper>) -> Self {
        Self {
            node: ChannelNode::Leaf(source),
            callbacks: CallbackTable::new(),
            connection: ConnectionStyle::Unconnected,
            timestamp: 0,
            mapper,
        }
    }

    pub fn group(group: RenderGroup) -> Self {
        Self {
            node: ChannelNode::Group(Box::new(group)),
            callbacks: CallbackTable::new(),
            connection: ConnectionStyle::Unconnected,
            timestamp: 0,
            mapper: None,
        }
    }

    pub fn node(&self) -> &ChannelNode {
        &self.node
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackTable {
        &mut self.callbacks
    }

    pub fn connection(&self) -> ConnectionStyle {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionStyle) {
        self.connection = connection;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Renders `frames` frames into `audio` and advances the channel timestamp.
    pub fn render(&mut self, frames: usize, audio: &mut [f32]) {
        let timestamp = self.timestamp;
        let Self {
            node,
            callbacks,
            connection,
            mapper,
            ..
        } = &mut *self;
        let mut producer = NodeProducer { node, mapper };

        let result = match connection {
            ConnectionStyle::Unconnected => {
                audio.fill(0.0);
                Ok(())
            }
            ConnectionStyle::Direct => producer.produce(timestamp, frames, audio),
            ConnectionStyle::Interposed => {
                callbacks.run_filters(&mut producer, timestamp, frames, audio)
            }
        };
        if result.is_err() {
            audio.fill(0.0);
        }
        if *connection == ConnectionStyle::Interposed {
            callbacks.fan_out(timestamp, frames, audio);
        }

        self.timestamp = timestamp.wrapping_add(frames as u64);
    }
}

struct NodeProducer<'a> {
    node: &'a mut ChannelNode,
    mapper: &'a mut Option<ChannelMapper>,
}

impl AudioProducer for NodeProducer<'_> {
    fn produce(&mut self, timestamp: u64, frames: usize, audio: &mut [f32]) -> Result<(), RenderError> {
        audio.fill(0.0);
        match &mut *self.node {
            ChannelNode::Leaf(source) => match self.mapper.as_mut() {
                Some(mapper) => mapper.render(source.as_ref(), timestamp, frames, audio),
                None => source.render(timestamp, frames, audio),
            },
            ChannelNode::Group(group) => {
                group.mix(frames, audio);
                Ok(())
            }
        }
    }
}

/// A group: up to [`MAX_CHANNELS`] children summed through a [`MixerNode`].
#[derive(Debug)]
pub struct RenderGroup {
    id: GroupId,
    channels: u16,
    children: FixedList<RenderChannel, MAX_CHANNELS>,
    mixer: Option<Arc<MixerNode>>,
    level: Arc<LevelMonitor>,
    scratch: Vec<f32>,
}

impl RenderGroup {
    /// Allocates a group whose scratch holds `max_frames` frames of `channels` channels.
    pub fn new(
        id: GroupId,
        channels: u16,
        max_frames: usize,
        mixer: Option<Arc<MixerNode>>,
        level: Arc<LevelMonitor>,
    ) -> Self {
        Self {
            id,
            channels,
            children: FixedList::new(),
            mixer,
            level,
            scratch: vec![0.0; usize::from(channels) * max_frames],
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, index: usize) -> Option<&RenderChannel> {
        self.children.get(index)
    }

    pub fn mixer(&self) -> Option<&Arc<MixerNode>> {
        self.mixer.as_ref()
    }

    /// Swaps in a new mixer resource and returns the previous one.
    pub fn replace_mixer(&mut self, mixer: Option<Arc<MixerNode>>) -> Option<Arc<MixerNode>> {
        std::mem::replace(&mut self.mixer, mixer)
    }

    /// Appends children from `incoming`, taking each slot. Stops when full, leaving
    /// the rest in place. Returns the number appended.
    pub fn append(&mut self, incoming: &mut [Option<RenderChannel>]) -> usize {
        let mut appended = 0;
        for slot in incoming.iter_mut() {
            let Some(channel) = slot.take() else {
                continue;
            };
            if let Err(back) = self.children.push(channel) {
                *slot = Some(back);
                break;
            }
            appended += 1;
        }
        appended
    }

    /// Removes the children at `indices` (descending order) into `displaced`,
    /// shifting the mixer's bus parameters down with them.
    pub fn remove(&mut self, indices: &[usize], displaced: &mut Vec<RenderChannel>) {
        for &index in indices {
            let Some(channel) = self.children.remove(index) else {
                continue;
            };
            if let Some(mixer) = &self.mixer {
                mixer.remove_bus(index);
            }
            // Capacity is reserved on the control side; this never reallocates.
            displaced.push(channel);
        }
    }

    fn find_mut(&mut self, id: GroupId) -> Option<&mut RenderGroup> {
        if self.id == id {
            return Some(self);
        }
        for child in self.children.iter_mut() {
            if let ChannelNode::Group(group) = &mut child.node {
                if let Some(found) = group.find_mut(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn find(&self, id: GroupId) -> Option<&RenderGroup> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| match &child.node {
            ChannelNode::Group(group) => group.find(id),
            ChannelNode::Leaf(_) => None,
        })
    }

    fn for_each_group_mut(&mut self, f: &mut dyn FnMut(&mut RenderGroup)) {
        f(self);
        for child in self.children.iter_mut() {
            if let ChannelNode::Group(group) = &mut child.node {
                group.for_each_group_mut(f);
            }
        }
    }

    fn for_each_channel_mut(&mut self, f: &mut dyn FnMut(&mut RenderChannel)) {
        for child in self.children.iter_mut() {
            f(child);
            if let ChannelNode::Group(group) = &mut child.node {
                group.for_each_channel_mut(f);
            }
        }
    }

    fn is_consistent(&self) -> bool {
        let buses_ok = self
            .mixer
            .as_ref()
            .is_none_or(|mixer| mixer.bus_count() <= self.children.len());
        buses_ok
            && self.children.is_dense()
            && self.children.iter().all(|child| match &child.node {
                ChannelNode::Group(group) => group.is_consistent(),
                ChannelNode::Leaf(_) => true,
            })
    }

    /// Sums enabled children into `out` with their bus gains.
    fn mix(&mut self, frames: usize, out: &mut [f32]) {
        out.fill(0.0);
        let channels = usize::from(self.channels);
        let samples = frames * channels;
        let Some(mixer) = self.mixer.as_ref() else {
            return;
        };
        if samples > self.scratch.len() || samples > out.len() {
            return;
        }

        let buses = mixer.bus_count().min(self.children.len());
        for (bus, child) in self.children.iter_mut().enumerate().take(buses) {
            if !mixer.is_enabled(bus) {
                continue;
            }
            let scratch = &mut self.scratch[..samples];
            child.render(frames, scratch);

            let gains = mixer.gains(bus, channels);
            if channels == 2 {
                for (dst, src) in out[..samples].chunks_exact_mut(2).zip(scratch.chunks_exact(2)) {
                    dst[0] += src[0] * gains.left;
                    dst[1] += src[1] * gains.right;
                }
            } else {
                for (dst, src) in out[..samples].iter_mut().zip(scratch.iter()) {
                    *dst += src * gains.left;
                }
            }
        }

        self.level.feed(&out[..samples]);
    }
}

/// State owned by the render side of the engine's message bridge.
#[derive(Debug)]
pub struct RenderState {
    root: RenderChannel,
    input: InputRouter,
    session: SessionSnapshot,
    sample_time: u64,
    channels: u16,
    max_frames: usize,
}

impl RenderState {
    /// Builds the render state around `top`, which becomes the root channel's group.
    pub fn new(top: RenderGroup, input_level: Arc<LevelMonitor>, max_frames: usize) -> Self {
        let channels = top.channels;
        let mut root = RenderChannel::group(top);
        root.connection = ConnectionStyle::Direct;
        Self {
            root,
            input: InputRouter::new(input_level),
            session: SessionSnapshot::default(),
            sample_time: 0,
            channels,
            max_frames: max_frames.max(1),
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_time(&self) -> u64 {
        self.sample_time
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session
    }

    pub fn set_session(&mut self, session: SessionSnapshot) {
        self.session = session;
    }

    pub fn root(&self) -> &RenderChannel {
        &self.root
    }

    pub fn input(&self) -> &InputRouter {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut InputRouter {
        &mut self.input
    }

    pub fn group(&self, id: GroupId) -> Option<&RenderGroup> {
        match &self.root.node {
            ChannelNode::Group(top) => top.find(id),
            ChannelNode::Leaf(_) => None,
        }
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut RenderGroup> {
        match &mut self.root.node {
            ChannelNode::Group(top) => top.find_mut(id),
            ChannelNode::Leaf(_) => None,
        }
    }

    pub fn channel_mut(&mut self, location: Location) -> Option<&mut RenderChannel> {
        match location {
            Location::Root => Some(&mut self.root),
            Location::Child { group, index } => self.group_mut(group)?.children.get_mut(index),
        }
    }

    /// Adds a callback to the channel at `location`, taking it from `slot`. The
    /// callback stays in `slot` if the channel is gone or its table is full.
    pub fn add_callback(&mut self, location: Location, slot: &mut Option<CallbackEntry>) -> bool {
        let Some(channel) = self.channel_mut(location) else {
            return false;
        };
        let Some(entry) = slot.take() else {
            return false;
        };
        match channel.callbacks.add(entry.id, entry.callback) {
            Ok(()) => true,
            Err(callback) => {
                *slot = Some(CallbackEntry {
                    id: entry.id,
                    callback,
                });
                false
            }
        }
    }

    pub fn remove_callback(&mut self, location: Location, id: CallbackId) -> Option<CallbackEntry> {
        let channel = self.channel_mut(location)?;
        channel
            .callbacks
            .remove(id)
            .map(|callback| CallbackEntry { id, callback })
    }

    pub fn for_each_group_mut(&mut self, mut f: impl FnMut(&mut RenderGroup)) {
        if let ChannelNode::Group(top) = &mut self.root.node {
            top.for_each_group_mut(&mut f);
        }
    }

    /// Visits every channel below the root.
    pub fn for_each_channel_mut(&mut self, mut f: impl FnMut(&mut RenderChannel)) {
        if let ChannelNode::Group(top) = &mut self.root.node {
            top.for_each_channel_mut(&mut f);
        }
    }

    /// Whether every group's child list is dense and no mixer addresses more buses
    /// than its group has children.
    pub fn is_consistent(&self) -> bool {
        let tree = match &self.root.node {
            ChannelNode::Group(top) => top.is_consistent(),
            ChannelNode::Leaf(_) => false,
        };
        tree && self.input.is_consistent()
    }

    /// Renders one device callback's worth of interleaved output.
    pub fn process(&mut self, output: &mut [f32], input: Option<InputBlock<'_>>) {
        let channels = usize::from(self.channels);
        if channels == 0 {
            output.fill(0.0);
            return;
        }
        let total = output.len() / channels;
        output[total * channels..].fill(0.0);

        let mut offset = 0;
        while offset < total {
            let frames = (total - offset).min(self.max_frames);
            let slice = &mut output[offset * channels..(offset + frames) * channels];
            let input = input.map(|block| block.slice(offset, frames));
            self.render_slice(frames, slice, input);
            offset += frames;
        }
    }

    fn render_slice(&mut self, frames: usize, output: &mut [f32], input: Option<InputBlock<'_>>) {
        let timestamp = self.sample_time;
        self.root
            .callbacks
            .notify_timing(RenderPhase::PreRender, timestamp, frames);

        if let Some(input) = input {
            let stamp = timestamp.saturating_sub(self.session.input_latency_frames);
            self.input.process(input, frames, stamp);
        }

        self.root.render(frames, output);

        self.root
            .callbacks
            .notify_timing(RenderPhase::PostRender, timestamp, frames);
        self.sample_time = timestamp.wrapping_add(frames as u64);
    }
}

impl RenderHandle<RenderState> {
    /// Runs one render cycle into `output` and then drains the message bridge.
    ///
    /// Returns `false` and writes silence if the render side is held by a control
    /// thread, which only happens while the engine is starting or stopping.
    pub fn render(&self, output: &mut [f32], input: Option<InputBlock<'_>>) -> bool {
        let rendered = self.try_with(|side| {
            side.state_mut().process(&mut *output, input);
            side.drain();
        });
        if rendered.is_none() {
            output.fill(0.0);
        }
        rendered.is_some()
    }
}
