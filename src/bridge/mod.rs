//! Lock-free message bridge between control threads and the render thread.
//!
//! Two [`RingChannel`](crate::ring::RingChannel)s connect the sides:
//!
//! - **control → render** carries [`Message`]s holding render tasks. The render thread
//!   drains it once per output cycle with [`RenderSide::drain`].
//! - **render → control** returns every message after its task has run. Control threads
//!   collect returned messages with [`MessageBridge::poll_control_side`], run the
//!   responses and drop the messages, so memory allocated on a control thread is also
//!   freed on one.
//!
//! Exchanges come in two flavours: [`MessageBridge::send_async`] returns immediately and
//! its response runs on whichever control thread polls next (usually the
//! [`Poller`]); [`MessageBridge::send_sync`] tags the message with the calling thread and
//! waits, bounded by a timeout, until its own response has run. Responses tagged for a
//! different thread are left pending, so concurrent synchronous exchanges from several
//! threads never service each other's responses. A synchronous wait that times out
//! abandons its message, after which any polling thread may release it.
//!
//! When the render side is not active (engine stopped), nothing would ever drain the
//! ring, so sends execute the queued work in place on the calling thread.

mod message;
mod poller;

pub use message::{Message, RenderTask, Response};
pub use poller::Poller;

use crate::error::{PetalMixError, Result};
use crate::ring::{RingChannel, RingReader, RingWriter};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Sizing and timing of a [`MessageBridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Messages each ring can hold.
    pub capacity: usize,
    /// Upper bound on a synchronous wait.
    pub sync_timeout: Duration,
    /// Sleep between polls during a synchronous wait.
    pub sync_poll_interval: Duration,
    /// Polling helper interval with no outstanding responses.
    pub idle_poll_interval: Duration,
    /// Polling helper interval while responses are outstanding.
    pub active_poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            sync_timeout: Duration::from_secs(1),
            sync_poll_interval: Duration::from_micros(500),
            idle_poll_interval: Duration::from_millis(100),
            active_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Result of a synchronous exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The render task ran and its response was serviced.
    Completed,
    /// The wait gave up; the task may or may not have run.
    TimedOut,
}

impl SyncOutcome {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// [`PetalMixError::MessageTimeout`] for a timed-out exchange.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::TimedOut => Err(PetalMixError::MessageTimeout),
        }
    }
}

/// Render-thread end of the bridge, owning the render state `S`.
pub struct RenderSide<S> {
    inbox: RingReader<Message<S>>,
    outbox: RingWriter<Message<S>>,
    state: S,
}

impl<S> RenderSide<S> {
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Executes every queued message and hands it back to the control side.
    ///
    /// Bounded by what is queued right now; never waits. Stops early, leaving work
    /// queued for the next cycle, when the return ring has no free slot.
    pub fn drain(&mut self) -> usize {
        let mut processed = 0;
        while self.outbox.vacant_len() > 0 {
            let Some(mut message) = self.inbox.pop() else {
                break;
            };
            message.execute(&mut self.state);
            // Cannot fail: a slot was free and this is the only writer.
            let _ = self.outbox.push(message);
            processed += 1;
        }
        processed
    }

    pub fn pending(&self) -> usize {
        self.inbox.occupied_len()
    }
}

/// Shared handle through which the render thread reaches its [`RenderSide`].
pub struct RenderHandle<S> {
    side: Arc<Mutex<RenderSide<S>>>,
}

impl<S> Clone for RenderHandle<S> {
    fn clone(&self) -> Self {
        Self {
            side: self.side.clone(),
        }
    }
}

impl<S> RenderHandle<S> {
    /// Runs `f` with the render side if it is immediately available.
    ///
    /// Never waits: returns `None` when a control thread holds the render side, which
    /// only happens while the render side is marked inactive.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut RenderSide<S>) -> R) -> Option<R> {
        match self.side.try_lock() {
            Ok(mut side) => Some(f(&mut side)),
            Err(TryLockError::Poisoned(poisoned)) => Some(f(&mut poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

struct Inbound<S> {
    reader: RingReader<Message<S>>,
    pending: VecDeque<Message<S>>,
}

impl<S> Inbound<S> {
    fn collect(&mut self) {
        while let Some(message) = self.reader.pop() {
            self.pending.push_back(message);
        }
    }
}

struct Shared<S> {
    outbound: Mutex<RingWriter<Message<S>>>,
    inbound: Mutex<Inbound<S>>,
    render: Arc<Mutex<RenderSide<S>>>,
    render_active: AtomicBool,
    pending_responses: AtomicUsize,
    timeouts: AtomicU64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    config: BridgeConfig,
}

/// Control-side handle of the bridge. Cheap to clone; all clones share the rings.
pub struct MessageBridge<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for MessageBridge<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Send + 'static> MessageBridge<S> {
    /// Creates a bridge whose render side owns `state`. The render side starts inactive.
    pub fn new(state: S, config: BridgeConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (outbound, inbox) = RingChannel::with_capacity(capacity).split();
        let (outbox, returns) = RingChannel::with_capacity(capacity).split();
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        Self {
            shared: Arc::new(Shared {
                outbound: Mutex::new(outbound),
                inbound: Mutex::new(Inbound {
                    reader: returns,
                    pending: VecDeque::with_capacity(capacity),
                }),
                render: Arc::new(Mutex::new(RenderSide {
                    inbox,
                    outbox,
                    state,
                })),
                render_active: AtomicBool::new(false),
                pending_responses: AtomicUsize::new(0),
                timeouts: AtomicU64::new(0),
                wake_tx,
                wake_rx,
                config,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Handle for the render thread.
    pub fn render_handle(&self) -> RenderHandle<S> {
        RenderHandle {
            side: self.shared.render.clone(),
        }
    }

    /// Marks whether a render thread is draining the bridge.
    pub fn set_render_active(&self, active: bool) {
        self.shared.render_active.store(active, Ordering::SeqCst);
        if !active {
            self.flush_locally();
        }
    }

    pub fn is_render_active(&self) -> bool {
        self.shared.render_active.load(Ordering::SeqCst)
    }

    /// Responses requested but not yet serviced.
    pub fn pending_responses(&self) -> usize {
        self.shared.pending_responses.load(Ordering::SeqCst)
    }

    /// Number of synchronous exchanges that gave up waiting.
    pub fn timeout_count(&self) -> u64 {
        self.shared.timeouts.load(Ordering::Relaxed)
    }

    /// Interval the polling helper should sleep for right now.
    pub fn poll_interval(&self) -> Duration {
        if self.pending_responses() > 0 {
            self.shared.config.active_poll_interval
        } else {
            self.shared.config.idle_poll_interval
        }
    }

    pub(crate) fn wake_receiver(&self) -> Receiver<()> {
        self.shared.wake_rx.clone()
    }

    /// Runs `f` directly against the render state.
    ///
    /// Only valid while the render side is inactive; returns `None` otherwise.
    pub fn with_render_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        if self.is_render_active() {
            return None;
        }
        let mut side = lock(&self.shared.render);
        Some(f(side.state_mut()))
    }

    /// Queues `task` for the render thread.
    ///
    /// `response`, if given, runs on a control thread after the task has executed:
    /// on `origin` if set, otherwise on the next thread that polls.
    pub fn send_async(
        &self,
        task: Option<RenderTask<S>>,
        response: Option<Response>,
        origin: Option<thread::ThreadId>,
    ) -> Result<()> {
        self.enqueue(Message::new(task, response, origin))
    }

    fn enqueue(&self, mut message: Message<S>) -> Result<()> {
        let has_response = message.has_response();
        if has_response {
            self.shared.pending_responses.fetch_add(1, Ordering::SeqCst);
        }

        let mut attempts = 0;
        loop {
            let pushed = lock(&self.shared.outbound).push(message);
            match pushed {
                Ok(()) => break,
                Err(rejected) => {
                    message = rejected;
                    attempts += 1;
                    if attempts < 2 && !self.is_render_active() {
                        self.flush_locally();
                        continue;
                    }
                    if has_response {
                        self.shared.pending_responses.fetch_sub(1, Ordering::SeqCst);
                    }
                    log::error!(
                        "Message ring full ({} messages), render side active: {}",
                        self.shared.config.capacity,
                        self.is_render_active()
                    );
                    return Err(PetalMixError::RingBuffer(format!(
                        "control-to-render ring full ({} messages)",
                        self.shared.config.capacity
                    )));
                }
            }
        }

        if has_response {
            let _ = self.shared.wake_tx.try_send(());
        }

        if !self.is_render_active() {
            self.flush_locally();
            self.poll_control_side();
        }
        Ok(())
    }

    /// Queues `task` and waits until it has executed on the render thread.
    ///
    /// The wait is bounded by the configured timeout. On timeout the bridge logs a
    /// warning, counts it, tries a local drain without waiting and returns
    /// [`SyncOutcome::TimedOut`]; callers proceed on a best-effort basis. A message
    /// that is still outstanding then is abandoned: whichever thread polls next
    /// releases it.
    pub fn send_sync<F>(&self, task: F) -> Result<SyncOutcome>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let message = Message::new(
            Some(Box::new(task)),
            Some(Box::new(move || flag.store(true, Ordering::Release))),
            Some(thread::current().id()),
        )
        .with_abandon_flag(abandoned.clone());
        self.enqueue(message)?;

        let timeout = self.shared.config.sync_timeout;
        let started = Instant::now();
        loop {
            if done.load(Ordering::Acquire) {
                return Ok(SyncOutcome::Completed);
            }
            self.poll_control_side();
            if done.load(Ordering::Acquire) {
                return Ok(SyncOutcome::Completed);
            }

            if started.elapsed() >= timeout {
                let timeouts = self.shared.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Timed out after {:?} waiting for the render thread (render active: {}, timeouts so far: {}); forcing local drain",
                    timeout,
                    self.is_render_active(),
                    timeouts
                );
                self.force_drain();
                self.poll_control_side();
                if done.load(Ordering::Acquire) {
                    return Ok(SyncOutcome::Completed);
                }
                abandoned.store(true, Ordering::Release);
                let _ = self.shared.wake_tx.try_send(());
                return Ok(SyncOutcome::TimedOut);
            }

            thread::sleep(self.shared.config.sync_poll_interval);
        }
    }

    /// Services returned messages that belong to the calling thread or to nobody.
    ///
    /// Responses run in the order their requests were queued, outside the bridge's
    /// internal lock so they may send further messages. Returns the number of
    /// responses run.
    pub fn poll_control_side(&self) -> usize {
        let current = thread::current().id();
        let ready = {
            let mut inbound = lock(&self.shared.inbound);
            inbound.collect();

            let mut ready = Vec::new();
            let mut index = 0;
            while index < inbound.pending.len() {
                if inbound.pending[index].serviceable_by(current) {
                    if let Some(message) = inbound.pending.remove(index) {
                        ready.push(message);
                    }
                } else {
                    index += 1;
                }
            }
            ready
        };

        let mut serviced = 0;
        for mut message in ready {
            if let Some(response) = message.response.take() {
                self.shared.pending_responses.fetch_sub(1, Ordering::SeqCst);
                response();
                serviced += 1;
            }
        }
        serviced
    }

    /// Drains the render side on the calling thread until the inbox is empty.
    fn flush_locally(&self) {
        loop {
            let (processed, remaining) = {
                let mut side = lock(&self.shared.render);
                let processed = side.drain();
                (processed, side.pending())
            };
            lock(&self.shared.inbound).collect();
            if remaining == 0 || processed == 0 {
                break;
            }
        }
    }

    /// Drains the render side if it can be acquired without waiting.
    fn force_drain(&self) {
        let handle = self.render_handle();
        let drained = handle.try_with(|side| side.drain());
        match drained {
            Some(count) => log::debug!("Forced local drain executed {} messages", count),
            None => log::debug!("Forced local drain skipped: render side busy"),
        }
        lock(&self.shared.inbound).collect();
    }
}
