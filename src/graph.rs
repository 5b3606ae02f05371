//! Control-side mirror of the mix tree and the topology mutation protocol.
//!
//! [`ChannelGraph`] keeps a record for every channel and group the render thread
//! knows about. Mutations build the new render-side pieces here, hand them over in a
//! single render task through [`MessageBridge::send_sync`], and update the mirror
//! once the task has run. Anything the render thread removes travels back inside
//! the same message and is dropped on the control side.
//!
//! Per-bus volume, pan, mute and playing state are not bridged: they are written
//! straight into the parent group's [`MixerNode`], one atomic store each.

use crate::bridge::{MessageBridge, SyncOutcome};
use crate::callbacks::{Callback, CallbackEntry, CallbackFlags, CallbackId, MAX_CALLBACKS};
use crate::error::{PetalMixError, Result};
use crate::level::{LevelMonitor, Levels};
use crate::mixer::{MAX_CHANNELS, MixerNode};
use crate::render::{
    ChannelMapper, ConnectionStyle, GroupId, InputEntry, Location, MAX_INPUT_SELECTIONS,
    RenderChannel, RenderGroup, RenderState,
};
use crate::source::{AudioFormat, AudioSource, PropertyNotifier, SourceId, SourceProperties};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A channel addressed by the public API.
#[derive(Clone, Copy)]
pub enum Target<'a> {
    Source(&'a Arc<dyn AudioSource>),
    Group(GroupId),
}

impl<'a> From<&'a Arc<dyn AudioSource>> for Target<'a> {
    fn from(source: &'a Arc<dyn AudioSource>) -> Self {
        Self::Source(source)
    }
}

impl From<GroupId> for Target<'_> {
    fn from(group: GroupId) -> Self {
        Self::Group(group)
    }
}

impl std::fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(source) => write!(f, "Source({:p})", Arc::as_ptr(source)),
            Self::Group(id) => write!(f, "Group({})", id),
        }
    }
}

pub enum RecordKind {
    /// The channel wrapping the top group. The group itself is held by the graph.
    Root,
    Leaf {
        id: SourceId,
        source: Arc<dyn AudioSource>,
    },
    Group(GroupRecord),
}

/// Mirror of one render channel.
pub struct ChannelRecord {
    kind: RecordKind,
    properties: SourceProperties,
    format: AudioFormat,
    callbacks: Vec<(CallbackId, CallbackFlags)>,
    connection: ConnectionStyle,
    mapped: bool,
}

impl ChannelRecord {
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn properties(&self) -> SourceProperties {
        self.properties
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn connection(&self) -> ConnectionStyle {
        self.connection
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn callback_flags(&self) -> CallbackFlags {
        self.callbacks
            .iter()
            .fold(CallbackFlags::empty(), |acc, (_, flags)| acc | *flags)
    }

    pub fn is_source(&self, source: &Arc<dyn AudioSource>) -> bool {
        matches!(&self.kind, RecordKind::Leaf { source: own, .. } if std::ptr::addr_eq(Arc::as_ptr(own), Arc::as_ptr(source)))
    }

    pub fn is_group(&self, id: GroupId) -> bool {
        matches!(&self.kind, RecordKind::Group(group) if group.id == id)
    }

    /// Direct unless something has to intercept the channel's output.
    pub fn desired_connection(&self) -> ConnectionStyle {
        if self.mapped || self.callback_flags().intersects(CallbackFlags::INTERPOSING) {
            ConnectionStyle::Interposed
        } else {
            ConnectionStyle::Direct
        }
    }

    fn release(self) {
        match self.kind {
            RecordKind::Root => {}
            RecordKind::Leaf { source, .. } => source.detach(),
            RecordKind::Group(group) => {
                for child in group.children {
                    child.release();
                }
            }
        }
    }
}

/// Mirror of one group.
pub struct GroupRecord {
    id: GroupId,
    children: Vec<ChannelRecord>,
    mixer: Option<Arc<MixerNode>>,
    level: Arc<LevelMonitor>,
}

impl GroupRecord {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[ChannelRecord] {
        &self.children
    }

    pub fn mixer(&self) -> Option<&Arc<MixerNode>> {
        self.mixer.as_ref()
    }

    pub fn level(&self) -> &Arc<LevelMonitor> {
        &self.level
    }

    fn find(&self, id: GroupId) -> Option<&GroupRecord> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| match &child.kind {
            RecordKind::Group(group) => group.find(id),
            _ => None,
        })
    }

    fn find_mut(&mut self, id: GroupId) -> Option<&mut GroupRecord> {
        if self.id == id {
            return Some(self);
        }
        for child in self.children.iter_mut() {
            if let RecordKind::Group(group) = &mut child.kind {
                if let Some(found) = group.find_mut(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn find_channel(&self, predicate: &dyn Fn(&ChannelRecord) -> bool) -> Option<(GroupId, usize)> {
        for (index, child) in self.children.iter().enumerate() {
            if predicate(child) {
                return Some((self.id, index));
            }
            if let RecordKind::Group(group) = &child.kind {
                if let Some(found) = group.find_channel(predicate) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn walk(&self, f: &mut dyn FnMut(&GroupRecord)) {
        f(self);
        for child in &self.children {
            if let RecordKind::Group(group) = &child.kind {
                group.walk(f);
            }
        }
    }

    fn walk_mut(&mut self, f: &mut dyn FnMut(&mut GroupRecord)) {
        f(self);
        for child in self.children.iter_mut() {
            if let RecordKind::Group(group) = &mut child.kind {
                group.walk_mut(f);
            }
        }
    }
}

struct InputRecord {
    selection: Box<[u16]>,
    callbacks: Vec<CallbackId>,
}

/// Control-side mirror of the mix tree.
pub struct ChannelGraph {
    root: ChannelRecord,
    top: GroupRecord,
    inputs: Vec<InputRecord>,
    input_level: Arc<LevelMonitor>,
    format: AudioFormat,
    max_frames: usize,
    notifier: Sender<SourceId>,
    next_group: u32,
    next_source: u64,
    next_callback: u64,
    connection_updates: u64,
    torn_down: bool,
}

impl ChannelGraph {
    /// Creates the mirror with an empty top group, and the matching render state.
    pub fn new(format: AudioFormat, max_frames: usize, notifier: Sender<SourceId>) -> (Self, RenderState) {
        let mixer = Arc::new(MixerNode::new());
        let level = Arc::new(LevelMonitor::new());
        let input_level = Arc::new(LevelMonitor::new());

        let top = RenderGroup::new(
            GroupId::TOP,
            format.channels,
            max_frames,
            Some(mixer.clone()),
            level.clone(),
        );
        let state = RenderState::new(top, input_level.clone(), max_frames);

        let top = GroupRecord {
            id: GroupId::TOP,
            children: Vec::new(),
            mixer: Some(mixer),
            level,
        };
        let root = ChannelRecord {
            kind: RecordKind::Root,
            properties: SourceProperties::default(),
            format,
            callbacks: Vec::new(),
            connection: ConnectionStyle::Direct,
            mapped: false,
        };

        let graph = Self {
            root,
            top,
            inputs: Vec::new(),
            input_level,
            format,
            max_frames,
            notifier,
            next_group: 1,
            next_source: 1,
            next_callback: 1,
            connection_updates: 0,
            torn_down: false,
        };
        (graph, state)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Number of connection-style changes sent to the render thread so far.
    pub fn connection_updates(&self) -> u64 {
        self.connection_updates
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn top(&self) -> &GroupRecord {
        &self.top
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupRecord> {
        self.top.find(id)
    }

    fn group_mut(&mut self, id: GroupId) -> Option<&mut GroupRecord> {
        self.top.find_mut(id)
    }

    fn require_group(&self, id: GroupId) -> Result<&GroupRecord> {
        self.group(id)
            .ok_or_else(|| PetalMixError::NotFound(format!("{} is not in the graph", id)))
    }

    /// Depth-first search for the first channel matching `predicate`, returning its
    /// group and index. The root channel is not a candidate.
    pub fn find(&self, predicate: impl Fn(&ChannelRecord) -> bool) -> Option<(GroupId, usize)> {
        self.top.find_channel(&predicate)
    }

    pub fn locate(&self, target: Target<'_>) -> Option<Location> {
        match target {
            Target::Group(GroupId::TOP) => Some(Location::Root),
            Target::Group(id) => self.find(|record| record.is_group(id)).map(Location::from),
            Target::Source(source) => self.find(|record| record.is_source(source)).map(Location::from),
        }
    }

    fn require_location(&self, target: Target<'_>) -> Result<Location> {
        self.locate(target)
            .ok_or_else(|| PetalMixError::NotFound(format!("{:?} is not in the graph", target)))
    }

    pub fn record(&self, location: Location) -> Option<&ChannelRecord> {
        match location {
            Location::Root => Some(&self.root),
            Location::Child { group, index } => self.group(group)?.children.get(index),
        }
    }

    fn record_mut(&mut self, location: Location) -> Option<&mut ChannelRecord> {
        match location {
            Location::Root => Some(&mut self.root),
            Location::Child { group, index } => self.group_mut(group)?.children.get_mut(index),
        }
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids = Vec::new();
        self.top.walk(&mut |group| ids.push(group.id));
        ids
    }

    /// Adds leaf channels for `sources` to `group`.
    ///
    /// Sources beyond the group's capacity are rejected with a warning and a
    /// [`PetalMixError::CapacityExceeded`]; the ones that fit are still added.
    pub fn add_channels(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        sources: &[Arc<dyn AudioSource>],
        group: GroupId,
    ) -> Result<usize> {
        let start = self.require_group(group)?.len();
        if sources.is_empty() {
            return Ok(0);
        }
        let accepted = sources.len().min(MAX_CHANNELS - start);
        if accepted < sources.len() {
            log::warn!(
                "{} is full: rejecting {} of {} channels",
                group,
                sources.len() - accepted,
                sources.len()
            );
        }
        if accepted == 0 {
            return Err(PetalMixError::CapacityExceeded {
                what: "channel group",
                capacity: MAX_CHANNELS,
            });
        }

        let mut records = Vec::with_capacity(accepted);
        let mut incoming = Vec::with_capacity(accepted);
        for source in &sources[..accepted] {
            let id = SourceId(self.next_source);
            self.next_source += 1;

            let properties = source.properties().unwrap_or_default();
            let format = source.format().unwrap_or(self.format);
            if format.sample_rate != self.format.sample_rate {
                log::warn!(
                    "Source {:?} renders at {} Hz, graph runs at {} Hz; audio is not resampled",
                    id,
                    format.sample_rate,
                    self.format.sample_rate
                );
            }
            let mapper = (format.channels != self.format.channels)
                .then(|| ChannelMapper::new(format.channels, self.max_frames));

            records.push(ChannelRecord {
                kind: RecordKind::Leaf {
                    id,
                    source: source.clone(),
                },
                properties,
                format,
                callbacks: Vec::new(),
                connection: ConnectionStyle::Unconnected,
                mapped: mapper.is_some(),
            });
            incoming.push(Some(RenderChannel::leaf(source.clone(), mapper)));
        }

        exchange(bridge, "add channels", move |state: &mut RenderState| {
            if let Some(target) = state.group_mut(group) {
                target.append(&mut incoming);
            }
        })?;

        for record in &records {
            if let RecordKind::Leaf { id, source } = &record.kind {
                source.attach(PropertyNotifier::new(*id, self.notifier.clone()));
            }
        }
        if let Some(target) = self.group_mut(group) {
            target.children.extend(records);
        }
        log::debug!("Added {} channels to {}", accepted, group);

        self.relinearize(bridge, group, start..start + accepted)?;

        if accepted < sources.len() {
            return Err(PetalMixError::CapacityExceeded {
                what: "channel group",
                capacity: MAX_CHANNELS,
            });
        }
        Ok(accepted)
    }

    /// Removes the channels of `sources`, batching siblings per group. Sources not in
    /// the graph are skipped with a warning. Returns the number removed.
    pub fn remove_channels(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        sources: &[Arc<dyn AudioSource>],
    ) -> Result<usize> {
        let mut batches: BTreeMap<GroupId, Vec<usize>> = BTreeMap::new();
        for source in sources {
            match self.locate(Target::Source(source)) {
                Some(Location::Child { group, index }) => {
                    batches.entry(group).or_default().push(index)
                }
                _ => log::warn!("Cannot remove source {:p}: not in the graph", Arc::as_ptr(source)),
            }
        }

        let mut removed = 0;
        for (group, mut indices) in batches {
            indices.sort_unstable_by(|a, b| b.cmp(a));
            indices.dedup();
            removed += self.remove_children(bridge, group, &indices)?;
        }
        Ok(removed)
    }

    /// Adds an empty group under `parent` and returns its id.
    pub fn create_group(&mut self, bridge: &MessageBridge<RenderState>, parent: GroupId) -> Result<GroupId> {
        let index = self.require_group(parent)?.len();
        if index >= MAX_CHANNELS {
            log::warn!("{} is full: cannot create a group in it", parent);
            return Err(PetalMixError::CapacityExceeded {
                what: "channel group",
                capacity: MAX_CHANNELS,
            });
        }

        let id = GroupId(self.next_group);
        self.next_group += 1;
        let mixer = (!self.torn_down).then(|| Arc::new(MixerNode::new()));
        let level = Arc::new(LevelMonitor::new());
        let render_group = RenderGroup::new(
            id,
            self.format.channels,
            self.max_frames,
            mixer.clone(),
            level.clone(),
        );
        let mut incoming = vec![Some(RenderChannel::group(render_group))];

        exchange(bridge, "create group", move |state: &mut RenderState| {
            if let Some(target) = state.group_mut(parent) {
                target.append(&mut incoming);
            }
        })?;

        let record = ChannelRecord {
            kind: RecordKind::Group(GroupRecord {
                id,
                children: Vec::new(),
                mixer,
                level,
            }),
            properties: SourceProperties::default(),
            format: self.format,
            callbacks: Vec::new(),
            connection: ConnectionStyle::Unconnected,
            mapped: false,
        };
        if let Some(target) = self.group_mut(parent) {
            target.children.push(record);
        }
        log::debug!("Created {} in {}", id, parent);

        self.relinearize(bridge, parent, index..index + 1)?;
        Ok(id)
    }

    /// Removes a group and everything in it. The top group cannot be removed.
    pub fn remove_group(&mut self, bridge: &MessageBridge<RenderState>, id: GroupId) -> Result<()> {
        if id == GroupId::TOP {
            return Err(PetalMixError::Engine("The top group cannot be removed".into()));
        }
        match self.locate(Target::Group(id)) {
            Some(Location::Child { group, index }) => {
                self.remove_children(bridge, group, &[index])?;
                Ok(())
            }
            _ => Err(PetalMixError::NotFound(format!("{} is not in the graph", id))),
        }
    }

    /// Disables the buses at `indices` (descending), removes the children on the
    /// render thread and releases their records once the removal has come back.
    fn remove_children(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        group: GroupId,
        indices: &[usize],
    ) -> Result<usize> {
        let Some(&lowest) = indices.last() else {
            return Ok(0);
        };
        if let Some(mixer) = self.require_group(group)?.mixer.as_ref() {
            for &index in indices {
                mixer.set_enabled(index, false);
            }
        }

        let order = indices.to_vec();
        let mut displaced: Vec<RenderChannel> = Vec::with_capacity(indices.len());
        exchange(bridge, "remove channels", move |state: &mut RenderState| {
            if let Some(target) = state.group_mut(group) {
                target.remove(&order, &mut displaced);
            }
        })?;

        let mut released = Vec::with_capacity(indices.len());
        if let Some(target) = self.group_mut(group) {
            for &index in indices {
                if index < target.children.len() {
                    released.push(target.children.remove(index));
                }
            }
        }
        let removed = released.len();
        for record in released {
            record.release();
        }
        log::debug!("Removed {} channels from {}", removed, group);

        let len = self.group(group).map_or(0, GroupRecord::len);
        self.relinearize(bridge, group, lowest..len)?;
        Ok(removed)
    }

    pub fn set_volume(&mut self, target: Target<'_>, volume: f32) -> Result<()> {
        self.update_properties(target, |properties| properties.volume = volume.clamp(0.0, 1.0))
    }

    pub fn set_pan(&mut self, target: Target<'_>, pan: f32) -> Result<()> {
        self.update_properties(target, |properties| properties.pan = pan.clamp(-1.0, 1.0))
    }

    pub fn set_muted(&mut self, target: Target<'_>, muted: bool) -> Result<()> {
        self.update_properties(target, |properties| properties.muted = muted)
    }

    pub fn set_playing(&mut self, target: Target<'_>, playing: bool) -> Result<()> {
        self.update_properties(target, |properties| properties.playing = playing)
    }

    pub fn properties(&self, target: Target<'_>) -> Option<SourceProperties> {
        self.record(self.locate(target)?).map(ChannelRecord::properties)
    }

    fn update_properties(&mut self, target: Target<'_>, update: impl FnOnce(&mut SourceProperties)) -> Result<()> {
        let location = self.require_location(target)?;
        if let Some(record) = self.record_mut(location) {
            update(&mut record.properties);
        }
        self.apply_parameters(location);
        Ok(())
    }

    /// Re-reads the properties of source `id` after a change notification.
    pub fn refresh_source(&mut self, id: SourceId) -> bool {
        let found = self.find(|record| matches!(&record.kind, RecordKind::Leaf { id: own, .. } if *own == id));
        let Some((group, index)) = found else {
            return false;
        };
        let location = Location::Child { group, index };
        if let Some(record) = self.record_mut(location) {
            if let RecordKind::Leaf { source, .. } = &record.kind {
                let mut properties = source.properties().unwrap_or_default();
                properties.volume = properties.volume.clamp(0.0, 1.0);
                properties.pan = properties.pan.clamp(-1.0, 1.0);
                record.properties = properties;
            }
        }
        self.apply_parameters(location);
        true
    }

    /// Writes the record's parameters into its parent's mixer. The muted volume
    /// parameter is zero and the enable parameter follows `playing`.
    fn apply_parameters(&self, location: Location) {
        let Location::Child { group, index } = location else {
            return;
        };
        let Some(parent) = self.group(group) else {
            return;
        };
        let (Some(mixer), Some(record)) = (parent.mixer.as_ref(), parent.children.get(index)) else {
            return;
        };
        let properties = record.properties;
        mixer.set_volume(index, if properties.muted { 0.0 } else { properties.volume });
        mixer.set_pan(index, properties.pan);
        mixer.set_enabled(index, properties.playing);
    }

    /// Reconciles connection styles and mixer parameters for `range` of `group`.
    ///
    /// Only channels whose desired style differs from the recorded one are sent to
    /// the render thread, in one batch; parameters for the range are re-applied, the
    /// bus count is updated, and sub-groups in the range are processed recursively.
    pub fn relinearize(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        group: GroupId,
        range: Range<usize>,
    ) -> Result<()> {
        let record = self.require_group(group)?;
        let range = range.start.min(record.len())..range.end.min(record.len());

        let mut updates = Vec::new();
        let mut subgroups = Vec::new();
        for index in range.clone() {
            let child = &record.children[index];
            let desired = if self.torn_down {
                ConnectionStyle::Unconnected
            } else {
                child.desired_connection()
            };
            if desired != child.connection {
                updates.push((Location::Child { group, index }, desired));
            }
            if let RecordKind::Group(sub) = &child.kind {
                subgroups.push((sub.id, sub.len()));
            }
        }

        self.send_connections(bridge, updates)?;

        for index in range {
            self.apply_parameters(Location::Child { group, index });
        }
        if let Some(record) = self.group(group) {
            if let Some(mixer) = &record.mixer {
                mixer.set_bus_count(record.len());
            }
        }

        for (sub, len) in subgroups {
            self.relinearize(bridge, sub, 0..len)?;
        }
        Ok(())
    }

    /// Reconciles the root channel's connection style.
    pub fn relinearize_root(&mut self, bridge: &MessageBridge<RenderState>) -> Result<()> {
        let desired = self.root.desired_connection();
        if desired != self.root.connection {
            self.send_connections(bridge, vec![(Location::Root, desired)])?;
        }
        Ok(())
    }

    fn relinearize_location(&mut self, bridge: &MessageBridge<RenderState>, location: Location) -> Result<()> {
        match location {
            Location::Root => self.relinearize_root(bridge),
            Location::Child { group, index } => self.relinearize(bridge, group, index..index + 1),
        }
    }

    fn send_connections(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        updates: Vec<(Location, ConnectionStyle)>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.connection_updates += updates.len() as u64;
        let batch = updates.clone();
        exchange(bridge, "update connections", move |state: &mut RenderState| {
            for &(location, style) in &batch {
                if let Some(channel) = state.channel_mut(location) {
                    channel.set_connection(style);
                }
            }
        })?;
        for (location, style) in updates {
            if let Some(record) = self.record_mut(location) {
                record.connection = style;
            }
        }
        Ok(())
    }

    /// Registers `callback` on the channel addressed by `target`.
    pub fn add_callback(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        target: Target<'_>,
        callback: Callback,
    ) -> Result<CallbackId> {
        let location = self.require_location(target)?;
        if callback.flags().contains(CallbackFlags::TIMING) && location != Location::Root {
            log::warn!("Timing observers only run on the top group, not on {:?}", target);
            return Err(PetalMixError::Configuration(
                "Timing observers can only be added to the top group".into(),
            ));
        }
        let count = self.record(location).map_or(0, ChannelRecord::callback_count);
        if count >= MAX_CALLBACKS {
            log::warn!("Callback table of {:?} is full ({} entries)", target, count);
            return Err(PetalMixError::CapacityExceeded {
                what: "callback table",
                capacity: MAX_CALLBACKS,
            });
        }

        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        let flags = callback.flags();
        let mut slot = Some(CallbackEntry { id, callback });
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = rejected.clone();
        exchange(bridge, "add callback", move |state: &mut RenderState| {
            if !state.add_callback(location, &mut slot) {
                flag.store(true, Ordering::Release);
            }
        })?;
        if rejected.load(Ordering::Acquire) {
            log::warn!("Render thread rejected {} on {:?}", id, target);
            return Err(PetalMixError::CapacityExceeded {
                what: "callback table",
                capacity: MAX_CALLBACKS,
            });
        }

        if let Some(record) = self.record_mut(location) {
            record.callbacks.push((id, flags));
        }
        self.relinearize_location(bridge, location)?;
        Ok(id)
    }

    /// Removes a channel callback or an input callback.
    pub fn remove_callback(&mut self, bridge: &MessageBridge<RenderState>, id: CallbackId) -> Result<()> {
        let has_id = |record: &ChannelRecord| record.callbacks.iter().any(|(own, _)| *own == id);
        let location = if has_id(&self.root) {
            Some(Location::Root)
        } else {
            self.find(has_id)
                .map(|(group, index)| Location::Child { group, index })
        };

        let Some(location) = location else {
            return self.remove_input_callback(bridge, id);
        };

        let mut displaced: Vec<CallbackEntry> = Vec::with_capacity(1);
        exchange(bridge, "remove callback", move |state: &mut RenderState| {
            if let Some(entry) = state.remove_callback(location, id) {
                displaced.push(entry);
            }
        })?;
        if let Some(record) = self.record_mut(location) {
            record.callbacks.retain(|(own, _)| *own != id);
        }
        self.relinearize_location(bridge, location)
    }

    /// Registers an input callback for the input channels in `selection`.
    pub fn add_input_callback(
        &mut self,
        bridge: &MessageBridge<RenderState>,
        selection: &[u16],
        callback: Callback,
    ) -> Result<CallbackId> {
        if selection.is_empty() {
            return Err(PetalMixError::Configuration(
                "Input selection must name at least one channel".into(),
            ));
        }
        if callback.flags().contains(CallbackFlags::TIMING) {
            return Err(PetalMixError::Configuration(
                "Timing observers can only be added to the top group".into(),
            ));
        }
        let existing = self.inputs.iter().position(|input| &*input.selection == selection);
        match existing {
            Some(index) if self.inputs[index].callbacks.len() >= MAX_CALLBACKS => {
                log::warn!("Input callback table for {:?} is full", selection);
                return Err(PetalMixError::CapacityExceeded {
                    what: "callback table",
                    capacity: MAX_CALLBACKS,
                });
            }
            None if self.inputs.len() >= MAX_INPUT_SELECTIONS => {
                log::warn!("Input selection table is full");
                return Err(PetalMixError::CapacityExceeded {
                    what: "input selection table",
                    capacity: MAX_INPUT_SELECTIONS,
                });
            }
            _ => {}
        }

        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        let key: Box<[u16]> = selection.into();
        let mut entry = existing
            .is_none()
            .then(|| InputEntry::new(selection, self.max_frames));
        let mut slot = Some(CallbackEntry { id, callback });
        let render_key = key.clone();
        exchange(bridge, "add input callback", move |state: &mut RenderState| {
            let input = state.input_mut();
            if let Some(new_entry) = entry.take() {
                if let Err(back) = input.push(new_entry) {
                    entry = Some(back);
                    return;
                }
            }
            let Some(target) = input.entry_mut(&render_key) else {
                return;
            };
            if let Some(CallbackEntry { id, callback }) = slot.take() {
                if let Err(callback) = target.callbacks_mut().add(id, callback) {
                    slot = Some(CallbackEntry { id, callback });
                }
            }
        })?;

        match existing {
            Some(index) => self.inputs[index].callbacks.push(id),
            None => self.inputs.push(InputRecord {
                selection: key,
                callbacks: vec![id],
            }),
        }
        Ok(id)
    }

    fn remove_input_callback(&mut self, bridge: &MessageBridge<RenderState>, id: CallbackId) -> Result<()> {
        let Some(index) = self
            .inputs
            .iter()
            .position(|input| input.callbacks.contains(&id))
        else {
            return Err(PetalMixError::NotFound(format!("{} is not registered", id)));
        };

        let key = self.inputs[index].selection.clone();
        let mut displaced: Vec<CallbackEntry> = Vec::with_capacity(1);
        let mut emptied: Vec<InputEntry> = Vec::with_capacity(1);
        exchange(bridge, "remove input callback", move |state: &mut RenderState| {
            let input = state.input_mut();
            if let Some(entry) = input.entry_mut(&key) {
                if let Some(callback) = entry.callbacks_mut().remove(id) {
                    displaced.push(CallbackEntry { id, callback });
                }
            }
            if let Some(entry) = input.remove_empty(&key) {
                emptied.push(entry);
            }
        })?;

        self.inputs[index].callbacks.retain(|own| *own != id);
        if self.inputs[index].callbacks.is_empty() {
            self.inputs.remove(index);
        }
        Ok(())
    }

    pub fn input_selections(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_level(&self) -> &Arc<LevelMonitor> {
        &self.input_level
    }

    pub fn set_metering(&self, group: GroupId, enabled: bool) -> Result<()> {
        self.require_group(group)?.level.set_enabled(enabled);
        Ok(())
    }

    pub fn reset_metering(&self, group: GroupId) -> Result<()> {
        self.require_group(group)?.level.request_reset();
        Ok(())
    }

    pub fn levels(&self, group: GroupId) -> Option<Levels> {
        self.group(group).map(|record| record.level.read())
    }

    /// Releases every mixer resource and disconnects every channel.
    pub fn teardown(&mut self, bridge: &MessageBridge<RenderState>) -> Result<()> {
        let groups = self.group_ids().len();
        let mut displaced: Vec<Option<Arc<MixerNode>>> = Vec::with_capacity(groups);
        exchange(bridge, "teardown", move |state: &mut RenderState| {
            state.for_each_group_mut(|group| displaced.push(group.replace_mixer(None)));
            state.for_each_channel_mut(|channel| channel.set_connection(ConnectionStyle::Unconnected));
        })?;

        self.top.walk_mut(&mut |group| {
            group.mixer = None;
            for child in group.children.iter_mut() {
                child.connection = ConnectionStyle::Unconnected;
            }
        });
        self.torn_down = true;
        log::info!("Mix graph torn down ({} groups)", groups);
        Ok(())
    }

    /// Rebuilds mixer resources after [`teardown`](Self::teardown) and reconnects the
    /// whole tree.
    pub fn setup(&mut self, bridge: &MessageBridge<RenderState>) -> Result<()> {
        let mut installs: Vec<(GroupId, Option<Arc<MixerNode>>)> = Vec::new();
        self.top.walk_mut(&mut |group| {
            let mixer = Arc::new(MixerNode::new());
            group.mixer = Some(mixer.clone());
            installs.push((group.id, Some(mixer)));
        });
        let groups = installs.len();

        exchange(bridge, "setup", move |state: &mut RenderState| {
            for (id, slot) in installs.iter_mut() {
                if let Some(group) = state.group_mut(*id) {
                    let previous = group.replace_mixer(slot.take());
                    *slot = previous;
                }
            }
        })?;
        self.torn_down = false;

        let len = self.top.len();
        self.relinearize(bridge, GroupId::TOP, 0..len)?;
        log::info!("Mix graph set up ({} groups)", groups);
        Ok(())
    }
}

impl From<(GroupId, usize)> for Location {
    fn from((group, index): (GroupId, usize)) -> Self {
        Location::Child { group, index }
    }
}

/// Sends `task` synchronously. A timeout is logged and treated as best effort.
fn exchange<F>(bridge: &MessageBridge<RenderState>, what: &str, task: F) -> Result<SyncOutcome>
where
    F: FnMut(&mut RenderState) + Send + 'static,
{
    let outcome = bridge.send_sync(task)?;
    if let Err(error) = outcome.into_result() {
        log::warn!("{} while applying '{}'; continuing", error, what);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::callbacks::{AudioReceiver, RenderPhase, TimingObserver};
    use crate::error::RenderError;
    use crate::mixer::PAN_LIMIT;
    use std::sync::atomic::AtomicUsize;

    struct Constant {
        value: f32,
        detached: AtomicUsize,
    }

    impl Constant {
        fn new(value: f32) -> Arc<Self> {
            Arc::new(Self {
                value,
                detached: AtomicUsize::new(0),
            })
        }
    }

    impl AudioSource for Constant {
        fn render(&self, _: u64, _: usize, audio: &mut [f32]) -> std::result::Result<(), RenderError> {
            audio.fill(self.value);
            Ok(())
        }

        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Silence;

    impl AudioReceiver for Silence {
        fn receive(&mut self, _: u64, _: usize, _: &[f32]) {}
    }

    struct Tick;

    impl TimingObserver for Tick {
        fn observe(&mut self, _: RenderPhase, _: u64, _: usize) {}
    }

    fn setup() -> (ChannelGraph, MessageBridge<RenderState>) {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let (graph, state) = ChannelGraph::new(AudioFormat::stereo(48000), 256, tx);
        (graph, MessageBridge::new(state, BridgeConfig::default()))
    }

    fn dyn_source(value: f32) -> Arc<dyn AudioSource> {
        Constant::new(value)
    }

    #[test]
    fn test_add_channels_connects_and_enables() {
        let (mut graph, bridge) = setup();
        let source = dyn_source(0.5);
        assert_eq!(graph.add_channels(&bridge, &[source.clone()], GroupId::TOP).unwrap(), 1);

        let top = graph.top();
        assert_eq!(top.len(), 1);
        assert_eq!(top.children()[0].connection(), ConnectionStyle::Direct);
        let mixer = top.mixer().unwrap();
        assert!(mixer.is_enabled(0));
        assert_eq!(mixer.bus_count(), 1);

        let render_len = bridge
            .with_render_state(|state| state.group(GroupId::TOP).map(|g| g.len()))
            .flatten();
        assert_eq!(render_len, Some(1));
    }

    #[test]
    fn test_group_capacity_is_enforced() {
        let (mut graph, bridge) = setup();
        let sources: Vec<_> = (0..MAX_CHANNELS).map(|_| dyn_source(0.1)).collect();
        assert_eq!(graph.add_channels(&bridge, &sources, GroupId::TOP).unwrap(), MAX_CHANNELS);

        let extra = dyn_source(0.2);
        assert!(matches!(
            graph.add_channels(&bridge, &[extra], GroupId::TOP),
            Err(PetalMixError::CapacityExceeded { capacity: MAX_CHANNELS, .. })
        ));
        assert_eq!(graph.top().len(), MAX_CHANNELS);
        let render_len = bridge
            .with_render_state(|state| state.group(GroupId::TOP).map(|g| g.len()))
            .flatten();
        assert_eq!(render_len, Some(MAX_CHANNELS));
    }

    #[test]
    fn test_partial_add_keeps_what_fits() {
        let (mut graph, bridge) = setup();
        let sources: Vec<_> = (0..MAX_CHANNELS - 1).map(|_| dyn_source(0.1)).collect();
        graph.add_channels(&bridge, &sources, GroupId::TOP).unwrap();
        let more = vec![dyn_source(0.2), dyn_source(0.3)];
        assert!(graph.add_channels(&bridge, &more, GroupId::TOP).is_err());
        assert_eq!(graph.top().len(), MAX_CHANNELS);
        assert!(graph.locate(Target::Source(&more[0])).is_some());
        assert!(graph.locate(Target::Source(&more[1])).is_none());
    }

    #[test]
    fn test_pan_at_the_edge_is_nudged() {
        let (mut graph, bridge) = setup();
        let source = dyn_source(0.5);
        graph.add_channels(&bridge, &[source.clone()], GroupId::TOP).unwrap();
        graph.set_pan(Target::Source(&source), 1.0).unwrap();

        assert_eq!(graph.properties(Target::Source(&source)).unwrap().pan, 1.0);
        assert_eq!(graph.top().mixer().unwrap().pan(0), PAN_LIMIT);
    }

    #[test]
    fn test_mute_zeroes_volume_parameter() {
        let (mut graph, bridge) = setup();
        let source = dyn_source(0.5);
        graph.add_channels(&bridge, &[source.clone()], GroupId::TOP).unwrap();
        graph.set_volume(Target::Source(&source), 0.7).unwrap();
        graph.set_muted(Target::Source(&source), true).unwrap();
        let mixer = graph.top().mixer().unwrap().clone();
        assert_eq!(mixer.volume(0), 0.0);

        graph.set_muted(Target::Source(&source), false).unwrap();
        assert!((mixer.volume(0) - 0.7).abs() < 1e-6);

        graph.set_playing(Target::Source(&source), false).unwrap();
        assert!(!mixer.is_enabled(0));
    }

    #[test]
    fn test_remove_releases_after_round_trip() {
        let (mut graph, bridge) = setup();
        let a = Constant::new(0.1);
        let b = Constant::new(0.2);
        let c = Constant::new(0.3);
        let sources: Vec<Arc<dyn AudioSource>> = vec![a.clone(), b.clone(), c.clone()];
        graph.add_channels(&bridge, &sources, GroupId::TOP).unwrap();
        graph.set_volume(Target::Source(&sources[2]), 0.4).unwrap();

        assert_eq!(graph.remove_channels(&bridge, &sources[..2]).unwrap(), 2);
        assert_eq!(a.detached.load(Ordering::SeqCst), 1);
        assert_eq!(b.detached.load(Ordering::SeqCst), 1);
        assert_eq!(c.detached.load(Ordering::SeqCst), 0);

        // Mirror record and render channel are both gone.
        assert_eq!(Arc::strong_count(&a), 2);
        assert_eq!(graph.top().len(), 1);
        let mixer = graph.top().mixer().unwrap();
        assert_eq!(mixer.bus_count(), 1);
        assert!((mixer.volume(0) - 0.4).abs() < 1e-6);
        assert!(bridge.with_render_state(|state| state.is_consistent()).unwrap());
    }

    #[test]
    fn test_nested_groups_and_find() {
        let (mut graph, bridge) = setup();
        let outer = graph.create_group(&bridge, GroupId::TOP).unwrap();
        let inner = graph.create_group(&bridge, outer).unwrap();
        let source = dyn_source(0.5);
        graph.add_channels(&bridge, &[source.clone()], inner).unwrap();

        assert_eq!(graph.find(|record| record.is_source(&source)), Some((inner, 0)));
        assert_eq!(
            graph.locate(Target::Group(inner)),
            Some(Location::Child { group: outer, index: 0 })
        );
        assert_eq!(graph.group_ids(), vec![GroupId::TOP, outer, inner]);

        graph.remove_group(&bridge, outer).unwrap();
        assert!(graph.group(inner).is_none());
        assert!(graph.locate(Target::Source(&source)).is_none());
        assert!(graph.remove_group(&bridge, GroupId::TOP).is_err());
    }

    #[test]
    fn test_relinearize_sends_only_changes() {
        let (mut graph, bridge) = setup();
        let sources = vec![dyn_source(0.1), dyn_source(0.2)];
        graph.add_channels(&bridge, &sources, GroupId::TOP).unwrap();
        let after_add = graph.connection_updates();
        assert_eq!(after_add, 2);

        graph.relinearize(&bridge, GroupId::TOP, 0..2).unwrap();
        assert_eq!(graph.connection_updates(), after_add);

        graph
            .add_callback(&bridge, Target::Source(&sources[1]), Callback::receiver(Silence))
            .unwrap();
        assert_eq!(graph.connection_updates(), after_add + 1);
        assert_eq!(
            graph.top().children()[1].connection(),
            ConnectionStyle::Interposed
        );
    }

    #[test]
    fn test_callback_table_capacity() {
        let (mut graph, bridge) = setup();
        let group = graph.create_group(&bridge, GroupId::TOP).unwrap();
        for _ in 0..MAX_CALLBACKS {
            graph
                .add_callback(&bridge, Target::Group(group), Callback::receiver(Silence))
                .unwrap();
        }
        assert!(matches!(
            graph.add_callback(&bridge, Target::Group(group), Callback::receiver(Silence)),
            Err(PetalMixError::CapacityExceeded { capacity: MAX_CALLBACKS, .. })
        ));
        let location = graph.locate(Target::Group(group)).unwrap();
        assert_eq!(graph.record(location).unwrap().callback_count(), MAX_CALLBACKS);
    }

    #[test]
    fn test_adding_no_channels_is_a_no_op() {
        let (mut graph, bridge) = setup();
        let group = graph.create_group(&bridge, GroupId::TOP).unwrap();
        assert_eq!(graph.add_channels(&bridge, &[], group).unwrap(), 0);
        assert_eq!(graph.add_channels(&bridge, &[], GroupId::TOP).unwrap(), 0);
        assert!(graph.group(group).unwrap().is_empty());
    }

    #[test]
    fn test_timing_observers_only_on_top_group() {
        let (mut graph, bridge) = setup();
        let source = dyn_source(0.5);
        graph.add_channels(&bridge, &[source.clone()], GroupId::TOP).unwrap();
        let group = graph.create_group(&bridge, GroupId::TOP).unwrap();

        assert!(matches!(
            graph.add_callback(&bridge, Target::Source(&source), Callback::timing(Tick)),
            Err(PetalMixError::Configuration(_))
        ));
        assert!(matches!(
            graph.add_callback(&bridge, Target::Group(group), Callback::timing(Tick)),
            Err(PetalMixError::Configuration(_))
        ));
        assert!(matches!(
            graph.add_input_callback(&bridge, &[0], Callback::timing(Tick)),
            Err(PetalMixError::Configuration(_))
        ));
        assert_eq!(graph.top().children()[0].callback_count(), 0);
        assert_eq!(graph.input_selections(), 0);

        graph
            .add_callback(&bridge, Target::Group(GroupId::TOP), Callback::timing(Tick))
            .unwrap();
        assert_eq!(graph.record(Location::Root).unwrap().callback_count(), 1);
    }

    #[test]
    fn test_teardown_and_setup_restore_parameters() {
        let (mut graph, bridge) = setup();
        let source = dyn_source(0.5);
        graph.add_channels(&bridge, &[source.clone()], GroupId::TOP).unwrap();
        graph.set_volume(Target::Source(&source), 0.3).unwrap();

        graph.teardown(&bridge).unwrap();
        assert!(graph.top().mixer().is_none());
        assert!(graph.is_torn_down());

        graph.setup(&bridge).unwrap();
        let mixer = graph.top().mixer().unwrap().clone();
        assert!((mixer.volume(0) - 0.3).abs() < 1e-6);
        assert_eq!(graph.top().children()[0].connection(), ConnectionStyle::Direct);
        let render_mixer = bridge
            .with_render_state(|state| state.group(GroupId::TOP).and_then(|g| g.mixer().cloned()))
            .flatten()
            .unwrap();
        assert!(Arc::ptr_eq(&mixer, &render_mixer));
    }

    #[test]
    fn test_input_callbacks_share_selection_entries() {
        let (mut graph, bridge) = setup();
        let first = graph
            .add_input_callback(&bridge, &[0, 1], Callback::receiver(Silence))
            .unwrap();
        let second = graph
            .add_input_callback(&bridge, &[0, 1], Callback::receiver(Silence))
            .unwrap();
        graph
            .add_input_callback(&bridge, &[1], Callback::receiver(Silence))
            .unwrap();
        assert_eq!(graph.input_selections(), 2);
        assert_eq!(bridge.with_render_state(|state| state.input().len()), Some(2));

        graph.remove_callback(&bridge, first).unwrap();
        assert_eq!(graph.input_selections(), 2);
        graph.remove_callback(&bridge, second).unwrap();
        assert_eq!(graph.input_selections(), 1);
        assert_eq!(bridge.with_render_state(|state| state.input().len()), Some(1));
        assert!(graph.remove_callback(&bridge, second).is_err());
    }
}
