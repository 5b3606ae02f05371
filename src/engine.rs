use crate::backend::{
    AudioBackend, DiagnosticLimiter, SessionInfo, SessionState, StreamFormat, retry_reconfigure,
};
use crate::bridge::{MessageBridge, Poller};
use crate::callbacks::{Callback, CallbackId, TimingObserver};
use crate::config::PetalMixDesc;
use crate::error::{PetalMixError, Result};
use crate::events::PetalMixEvent;
use crate::graph::{ChannelGraph, Target};
use crate::level::Levels;
use crate::mixer::MixerNode;
use crate::render::{GroupId, RenderState};
use crate::source::{AudioFormat, AudioSource, SourceProperties};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle state of a [`PetalMixEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    /// Recovery gave up. [`PetalMixEngine::recover`] or [`PetalMixEngine::start`]
    /// tries again.
    Failed,
}

/// Hierarchical mixing engine.
///
/// All methods take `&self` and may be called from any control thread. Topology
/// changes (channels, groups, callbacks) are exchanged synchronously with the
/// render thread; volume, pan, mute and playing state are written directly into
/// the mixer parameters.
///
/// # Architecture
///
/// - **Control threads**: call the engine, own the [`ChannelGraph`] mirror
/// - **Render thread**: driven by the [`AudioBackend`], renders the tree and drains
///   the message bridge once per cycle
/// - **Poller thread**: services bridge responses and source property
///   notifications in the background
pub struct PetalMixEngine {
    desc: PetalMixDesc,
    bridge: MessageBridge<RenderState>,
    graph: Arc<Mutex<ChannelGraph>>,
    backend: Mutex<Box<dyn AudioBackend>>,
    session: Mutex<SessionState>,
    state: Mutex<EngineState>,
    diagnostics: Mutex<DiagnosticLimiter>,
    event_sender: Sender<PetalMixEvent>,
    event_receiver: Receiver<PetalMixEvent>,
    reported_timeouts: AtomicU64,
    poller: Option<Poller>,
}

impl PetalMixEngine {
    /// Creates a stopped engine with an empty top group.
    pub fn new(desc: PetalMixDesc, backend: impl AudioBackend + 'static) -> Result<Self> {
        desc.validate()?;

        let (property_sender, property_receiver) = unbounded();
        let format = AudioFormat::new(desc.sample_rate, desc.channels);
        let (graph, state) = ChannelGraph::new(format, desc.max_frames_per_slice, property_sender);
        let bridge = MessageBridge::new(state, desc.bridge_config());
        let graph = Arc::new(Mutex::new(graph));
        let (event_sender, event_receiver) = unbounded();

        let tick_graph = graph.clone();
        let tick_events = event_sender.clone();
        let poller = Poller::spawn(bridge.clone(), move || {
            for source_id in property_receiver.try_iter() {
                if lock(&tick_graph).refresh_source(source_id) {
                    let _ = tick_events.send(PetalMixEvent::SourcePropertiesChanged { source_id });
                }
            }
        })
        .map_err(|e| {
            crate::error::PetalMixError::Engine(format!("Failed to spawn poller thread: {}", e))
        })?;

        log::info!(
            "PetalMix engine created: {} Hz, {} channels, {} frames per slice",
            desc.sample_rate,
            desc.channels,
            desc.max_frames_per_slice
        );

        Ok(Self {
            desc,
            bridge,
            graph,
            backend: Mutex::new(Box::new(backend)),
            session: Mutex::new(SessionState::new()),
            state: Mutex::new(EngineState::Stopped),
            diagnostics: Mutex::new(DiagnosticLimiter::default()),
            event_sender,
            event_receiver,
            reported_timeouts: AtomicU64::new(0),
            poller: Some(poller),
        })
    }

    pub fn desc(&self) -> &PetalMixDesc {
        &self.desc
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn bridge(&self) -> &MessageBridge<RenderState> {
        &self.bridge
    }

    /// Runs `f` against the control-side mirror of the mix tree.
    pub fn with_graph<R>(&self, f: impl FnOnce(&ChannelGraph) -> R) -> R {
        f(&lock(&self.graph))
    }

    /// Configures the backend, pushes the session snapshot and starts rendering.
    ///
    /// A fatal failure runs the recovery protocol up to
    /// [`PetalMixDesc::recovery_attempts`] times before the engine enters
    /// [`EngineState::Failed`] and the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == EngineState::Running {
            return Ok(());
        }

        match self.start_backend() {
            Ok(()) => {
                *state = EngineState::Running;
                log::info!("PetalMix engine started");
                self.emit(PetalMixEvent::EngineStarted);
                Ok(())
            }
            Err(error) if needs_recovery(&error) => self.run_recovery(&mut state, error),
            Err(error) => {
                self.log_failure(&error);
                self.emit(PetalMixEvent::EngineError {
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Stops rendering. Pending work queued for the render thread runs on the
    /// calling thread.
    pub fn stop(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == EngineState::Stopped {
            return Ok(());
        }
        self.stop_backend()?;
        *state = EngineState::Stopped;
        log::info!("PetalMix engine stopped");
        self.emit(PetalMixEvent::EngineStopped);
        Ok(())
    }

    /// Runs the recovery protocol now: stop, tear down, wait, set up, restart.
    pub fn recover(&self) -> Result<()> {
        let mut state = lock(&self.state);
        self.run_recovery(
            &mut state,
            PetalMixError::SystemFatal("recovery requested".into()),
        )
    }

    /// Collects pending events.
    ///
    /// Also the place where fatal device errors reported during rendering are
    /// noticed and recovered from, and where message timeouts and input problems
    /// become events.
    pub fn poll_events(&self) -> Vec<PetalMixEvent> {
        self.bridge.poll_control_side();

        let device_error = lock(&self.backend).take_device_error();
        if let Some(error) = device_error {
            let mut state = lock(&self.state);
            if *state == EngineState::Running {
                log::error!("Audio device failed while running: {}", error);
                let _ = self.run_recovery(&mut state, error);
            }
        }

        if self.is_running() {
            self.refresh_session();
        }

        let input_error = lock(&self.backend).take_input_error();
        if let Some(error) = input_error {
            self.report_input_error(error);
        }

        let total = self.bridge.timeout_count();
        let previous = self.reported_timeouts.swap(total, Ordering::Relaxed);
        if total > previous {
            self.emit(PetalMixEvent::MessageTimeouts {
                count: total - previous,
                total,
            });
        }

        self.event_receiver.try_iter().collect()
    }

    /// Adds `source` as a new channel of `group`.
    pub fn add_channel(&self, source: Arc<dyn AudioSource>, group: GroupId) -> Result<()> {
        self.add_channels(&[source], group).map(|_| ())
    }

    /// Adds one channel per source to `group`. When the group cannot take them all,
    /// the ones that fit are added and [`PetalMixError::CapacityExceeded`] is
    /// returned.
    pub fn add_channels(&self, sources: &[Arc<dyn AudioSource>], group: GroupId) -> Result<usize> {
        lock(&self.graph).add_channels(&self.bridge, sources, group)
    }

    pub fn remove_channel(&self, source: &Arc<dyn AudioSource>) -> Result<()> {
        match self.remove_channels(std::slice::from_ref(source))? {
            0 => Err(PetalMixError::NotFound(
                "Source is not attached to the mix graph".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn remove_channels(&self, sources: &[Arc<dyn AudioSource>]) -> Result<usize> {
        lock(&self.graph).remove_channels(&self.bridge, sources)
    }

    pub fn contains(&self, source: &Arc<dyn AudioSource>) -> bool {
        lock(&self.graph).locate(Target::Source(source)).is_some()
    }

    pub fn create_group(&self, parent: GroupId) -> Result<GroupId> {
        lock(&self.graph).create_group(&self.bridge, parent)
    }

    pub fn remove_group(&self, group: GroupId) -> Result<()> {
        lock(&self.graph).remove_group(&self.bridge, group)
    }

    pub fn set_volume<'a>(&self, target: impl Into<Target<'a>>, volume: f32) -> Result<()> {
        lock(&self.graph).set_volume(target.into(), volume)
    }

    pub fn set_pan<'a>(&self, target: impl Into<Target<'a>>, pan: f32) -> Result<()> {
        lock(&self.graph).set_pan(target.into(), pan)
    }

    pub fn set_muted<'a>(&self, target: impl Into<Target<'a>>, muted: bool) -> Result<()> {
        lock(&self.graph).set_muted(target.into(), muted)
    }

    pub fn set_playing<'a>(&self, target: impl Into<Target<'a>>, playing: bool) -> Result<()> {
        lock(&self.graph).set_playing(target.into(), playing)
    }

    pub fn properties<'a>(&self, target: impl Into<Target<'a>>) -> Option<SourceProperties> {
        lock(&self.graph).properties(target.into())
    }

    /// Installs `callback` on a channel. Callbacks on [`GroupId::TOP`] sit on the
    /// root channel and see the final output.
    pub fn add_callback<'a>(&self, target: impl Into<Target<'a>>, callback: Callback) -> Result<CallbackId> {
        lock(&self.graph).add_callback(&self.bridge, target.into(), callback)
    }

    /// Installs a timing observer called before and after every render slice.
    pub fn add_timing_observer(&self, observer: impl TimingObserver + 'static) -> Result<CallbackId> {
        self.add_callback(GroupId::TOP, Callback::timing(observer))
    }

    /// Installs `callback` on the input channels in `selection`.
    pub fn add_input_callback(&self, selection: &[u16], callback: Callback) -> Result<CallbackId> {
        lock(&self.graph).add_input_callback(&self.bridge, selection, callback)
    }

    pub fn remove_callback(&self, id: CallbackId) -> Result<()> {
        lock(&self.graph).remove_callback(&self.bridge, id)
    }

    pub fn set_metering(&self, group: GroupId, enabled: bool) -> Result<()> {
        lock(&self.graph).set_metering(group, enabled)
    }

    pub fn reset_metering(&self, group: GroupId) -> Result<()> {
        lock(&self.graph).reset_metering(group)
    }

    pub fn levels(&self, group: GroupId) -> Option<Levels> {
        lock(&self.graph).levels(group)
    }

    /// Levels of the final mix.
    pub fn output_levels(&self) -> Levels {
        self.levels(GroupId::TOP).unwrap_or(Levels::SILENT)
    }

    pub fn set_input_metering(&self, enabled: bool) {
        lock(&self.graph).input_level().set_enabled(enabled);
    }

    pub fn reset_input_metering(&self) {
        lock(&self.graph).input_level().request_reset();
    }

    pub fn input_levels(&self) -> Levels {
        lock(&self.graph).input_level().read()
    }

    /// Mixer parameters of `group`; `None` while torn down.
    pub fn mixer(&self, group: GroupId) -> Option<Arc<MixerNode>> {
        lock(&self.graph).group(group)?.mixer().cloned()
    }

    /// Device latencies and buffer duration, queried once per start.
    pub fn session_info(&self) -> SessionInfo {
        let backend = lock(&self.backend);
        lock(&self.session).info(&**backend)
    }

    pub fn input_channels(&self) -> u16 {
        lock(&self.backend).input_channels()
    }

    /// Synchronous exchanges that timed out since the engine was created.
    pub fn timeout_count(&self) -> u64 {
        self.bridge.timeout_count()
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.desc.sample_rate,
            channels: self.desc.channels,
            block_size: self.desc.block_size,
            max_frames: self.desc.max_frames_per_slice,
            enable_input: self.desc.enable_input,
        }
    }

    fn start_backend(&self) -> Result<()> {
        let format = self.stream_format();
        let mut backend = lock(&self.backend);

        retry_reconfigure(
            self.desc.reconfigure_attempts,
            self.desc.reconfigure_backoff,
            || backend.configure(&format),
        )?;
        if let Some(error) = backend.take_input_error() {
            self.report_input_error(error);
        }

        self.bridge.set_render_active(true);
        if let Err(error) = backend.start(self.bridge.render_handle()) {
            self.bridge.set_render_active(false);
            return Err(error);
        }

        let info = {
            let mut session = lock(&self.session);
            session.invalidate();
            session.info(&**backend)
        };
        drop(backend);
        self.push_session(info)
    }

    fn push_session(&self, info: SessionInfo) -> Result<()> {
        let snapshot = info.snapshot(self.desc.sample_rate);
        log::debug!("Session snapshot: {:?}", snapshot);
        self.bridge.send_async(
            Some(Box::new(move |state: &mut RenderState| state.set_session(snapshot))),
            None,
            None,
        )
    }

    /// Pushes a new session snapshot once the running device has measured its
    /// latency.
    fn refresh_session(&self) {
        let settled = {
            let backend = lock(&self.backend);
            if !backend.is_running() {
                return;
            }
            lock(&self.session).settle(&**backend)
        };
        if let Some(info) = settled {
            log::debug!("Device latency measured: {:?}", info);
            if let Err(error) = self.push_session(info) {
                log::warn!("Failed to update the session snapshot: {}", error);
            }
        }
    }

    fn stop_backend(&self) -> Result<()> {
        let result = lock(&self.backend).stop();
        self.bridge.set_render_active(false);
        lock(&self.session).invalidate();
        result
    }

    fn run_recovery(&self, state: &mut EngineState, error: PetalMixError) -> Result<()> {
        self.log_failure(&error);
        let mut last = error;

        for attempt in 1..=self.desc.recovery_attempts {
            log::warn!(
                "Recovering from '{}' (attempt {}/{})",
                last,
                attempt,
                self.desc.recovery_attempts
            );
            self.emit(PetalMixEvent::RecoveryStarted { attempt });
            match self.recover_once() {
                Ok(()) => {
                    *state = EngineState::Running;
                    log::info!("PetalMix engine recovered after {} attempt(s)", attempt);
                    self.emit(PetalMixEvent::Recovered { attempts: attempt });
                    self.emit(PetalMixEvent::EngineStarted);
                    return Ok(());
                }
                Err(error) => {
                    self.log_failure(&error);
                    last = error;
                }
            }
        }

        *state = EngineState::Failed;
        log::error!("PetalMix engine failed: {}", last);
        self.emit(PetalMixEvent::RecoveryFailed {
            error: last.to_string(),
        });
        Err(last)
    }

    fn recover_once(&self) -> Result<()> {
        if let Err(error) = self.stop_backend() {
            log::warn!("Stopping the backend during recovery failed: {}", error);
        }
        lock(&self.graph).teardown(&self.bridge)?;
        std::thread::sleep(self.desc.recovery_delay);
        lock(&self.graph).setup(&self.bridge)?;
        self.start_backend()
    }

    fn report_input_error(&self, error: PetalMixError) {
        log::warn!("{}; continuing without input", error);
        let event = match error {
            PetalMixError::InputAccessDenied => PetalMixEvent::InputAccessDenied,
            other => PetalMixEvent::InputUnavailable {
                reason: other.to_string(),
            },
        };
        self.emit(event);
    }

    fn log_failure(&self, error: &PetalMixError) {
        match error {
            PetalMixError::HardwareConfiguration(_) => {
                lock(&self.diagnostics).error(&error.to_string())
            }
            error if error.is_recoverable() => log::warn!("{}", error),
            error => log::error!("{}", error),
        }
    }

    fn emit(&self, event: PetalMixEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl Drop for PetalMixEngine {
    fn drop(&mut self) {
        if self.state() != EngineState::Stopped {
            let _ = self.stop_backend();
        }
        self.poller.take();
    }
}

fn needs_recovery(error: &PetalMixError) -> bool {
    matches!(
        error,
        PetalMixError::SystemFatal(_) | PetalMixError::AudioDevice(_)
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
