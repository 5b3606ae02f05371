//! # PetalMix
//!
//! A real-time safe hierarchical mixing engine for Rust.
//!
//! PetalMix owns a tree of channels and channel groups, routes output and input
//! audio through user callbacks (filters, receivers, timing observers) and carries
//! every configuration change from control threads to the hard-realtime render
//! thread through a lock-free message bridge. The render thread never allocates,
//! frees control-side memory or waits on a lock.
//!
//! ## Quick Start
//!
//! ```no_run
//! use petalmix::*;
//! use std::sync::Arc;
//!
//! struct Tone;
//!
//! impl AudioSource for Tone {
//!     fn render(&self, _: u64, _: usize, audio: &mut [f32]) -> Result<(), RenderError> {
//!         audio.fill(0.1);
//!         Ok(())
//!     }
//! }
//!
//! let engine = PetalMixEngine::new(PetalMixDesc::default(), CpalBackend::new())?;
//!
//! let tone: Arc<dyn AudioSource> = Arc::new(Tone);
//! let group = engine.create_group(GroupId::TOP)?;
//! engine.add_channel(tone.clone(), group)?;
//! engine.set_pan(&tone, -0.5)?;
//! engine.start()?;
//!
//! for event in engine.poll_events() {
//!     if event.is_error() {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok::<(), PetalMixError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`PetalMixEngine`]**: control-thread API, lifecycle and recovery
//! - **[`ChannelGraph`](graph::ChannelGraph)**: control-side mirror of the mix tree
//! - **[`RenderState`](render::RenderState)**: render-side tree and the per-cycle algorithm
//! - **[`MessageBridge`](bridge::MessageBridge)**: rings and exchange protocol between the two
//! - **[`AudioBackend`]**: device side; [`CpalBackend`] for hardware, [`OfflineBackend`] for
//!   caller-driven rendering
//! - **[`PetalMixEvent`]**: lifecycle, recovery and input events
//!
//! ## Architecture
//!
//! 1. **Control threads**: call the engine, which updates the mirror and exchanges
//!    render tasks with the render thread
//! 2. **Render thread**: the audio callback renders the tree, then drains the bridge once
//! 3. **Poller thread**: services responses and property notifications in the background

pub mod backend;
pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fixed;
pub mod graph;
pub mod level;
pub mod mixer;
pub mod render;
pub mod ring;
pub mod source;

pub use backend::{AudioBackend, CpalBackend, OfflineBackend, OfflineDriver, SessionInfo};
pub use callbacks::{
    AudioFilter, AudioProducer, AudioReceiver, Callback, CallbackFlags, CallbackId, RenderPhase,
    TimingObserver,
};
pub use config::PetalMixDesc;
pub use engine::{EngineState, PetalMixEngine};
pub use error::{PetalMixError, RenderError};
pub use events::PetalMixEvent;
pub use graph::Target;
pub use level::Levels;
pub use render::GroupId;
pub use source::{AudioFormat, AudioSource, PropertyNotifier, SourceId, SourceProperties};
