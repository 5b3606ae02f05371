use petalmix::*;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn desc() -> PetalMixDesc {
    PetalMixDesc::new()
        .max_frames_per_slice(256)
        .recovery(3, Duration::from_millis(1))
}

struct Constant(f32);

impl AudioSource for Constant {
    fn render(&self, _: u64, _: usize, audio: &mut [f32]) -> Result<(), RenderError> {
        audio.fill(self.0);
        Ok(())
    }
}

/// Source that reports its own volume and tells the engine when it changes.
struct Fader {
    volume_bits: AtomicU32,
    notifier: Mutex<Option<PropertyNotifier>>,
}

impl Fader {
    fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify();
        }
    }
}

impl AudioSource for Fader {
    fn render(&self, _: u64, _: usize, audio: &mut [f32]) -> Result<(), RenderError> {
        audio.fill(1.0);
        Ok(())
    }

    fn properties(&self) -> Option<SourceProperties> {
        Some(SourceProperties {
            volume: f32::from_bits(self.volume_bits.load(Ordering::Relaxed)),
            ..SourceProperties::default()
        })
    }

    fn attach(&self, notifier: PropertyNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    fn detach(&self) {
        self.notifier.lock().unwrap().take();
    }
}

#[test]
fn test_device_loss_is_recovered_on_poll() {
    init_logger();
    let (backend, driver) = OfflineBackend::new();
    let engine = PetalMixEngine::new(desc(), backend).unwrap();
    let source: Arc<dyn AudioSource> = Arc::new(Constant(0.5));
    engine.add_channel(source.clone(), GroupId::TOP).unwrap();
    engine.set_volume(&source, 0.5).unwrap();
    engine.start().unwrap();
    engine.poll_events();

    driver.inject_device_error(PetalMixError::SystemFatal("device unplugged".into()));
    assert!(!driver.is_running());

    let events = engine.poll_events();
    assert!(events.contains(&PetalMixEvent::RecoveryStarted { attempt: 1 }));
    assert!(events.contains(&PetalMixEvent::Recovered { attempts: 1 }));
    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(driver.start_count(), 2);

    // Mixer parameters survive the teardown and rebuild.
    let output = driver.render(16);
    assert!(output.iter().all(|&sample| (sample - 0.25).abs() < 1e-6));
}

#[test]
fn test_manual_recovery_after_failure() {
    init_logger();
    let (backend, driver) = OfflineBackend::new();
    driver.fail_next_starts(4);
    let engine = PetalMixEngine::new(desc(), backend).unwrap();
    assert!(engine.start().is_err());
    assert_eq!(engine.state(), EngineState::Failed);

    engine.recover().unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    assert!(driver.is_running());
}

#[test]
fn test_timeouts_become_events() {
    init_logger();
    let (backend, _driver) = OfflineBackend::new();
    let desc = desc().sync_timeout(Duration::from_millis(20));
    let engine = PetalMixEngine::new(desc, backend).unwrap();
    engine.start().unwrap();

    // Nothing renders, so the exchange times out and is forced through locally.
    let group = engine.create_group(GroupId::TOP).unwrap();
    assert!(engine.with_graph(|graph| graph.group(group).is_some()));
    assert!(engine.timeout_count() >= 1);

    let events = engine.poll_events();
    let reported = events.iter().find_map(|event| match event {
        PetalMixEvent::MessageTimeouts { count, total } => Some((*count, *total)),
        _ => None,
    });
    assert_eq!(reported, Some((engine.timeout_count(), engine.timeout_count())));
    assert!(
        !engine
            .poll_events()
            .iter()
            .any(|event| matches!(event, PetalMixEvent::MessageTimeouts { .. }))
    );
}

#[test]
fn test_property_notifications_update_the_mixer() {
    init_logger();
    let (backend, _driver) = OfflineBackend::new();
    let engine = PetalMixEngine::new(desc(), backend).unwrap();
    let fader = Arc::new(Fader {
        volume_bits: AtomicU32::new(1.0f32.to_bits()),
        notifier: Mutex::new(None),
    });
    let source: Arc<dyn AudioSource> = fader.clone();
    engine.add_channel(source.clone(), GroupId::TOP).unwrap();
    assert!(fader.notifier.lock().unwrap().is_some());

    fader.set_volume(0.3);
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(engine.poll_events());
        if events
            .iter()
            .any(|event| matches!(event, PetalMixEvent::SourcePropertiesChanged { .. }))
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!((engine.properties(&source).unwrap().volume - 0.3).abs() < 1e-6);
    let mixer = engine.mixer(GroupId::TOP).unwrap();
    assert!((mixer.volume(0) - 0.3).abs() < 1e-6);

    engine.remove_channel(&source).unwrap();
    assert!(fader.notifier.lock().unwrap().is_none());
}

#[test]
fn test_input_is_stamped_with_input_latency() {
    struct Stamp(Arc<AtomicU64>);

    impl AudioReceiver for Stamp {
        fn receive(&mut self, timestamp: u64, _: usize, _: &[f32]) {
            self.0.store(timestamp, Ordering::Relaxed);
        }
    }

    init_logger();
    let (backend, driver) = OfflineBackend::new();
    driver.set_input_channels(1);
    driver.set_latencies(Duration::from_millis(10), Duration::from_millis(2));
    let engine = PetalMixEngine::new(desc().enable_input(true), backend).unwrap();
    let stamp = Arc::new(AtomicU64::new(u64::MAX));
    engine
        .add_input_callback(&[0], Callback::receiver(Stamp(stamp.clone())))
        .unwrap();
    engine.start().unwrap();

    let info = engine.session_info();
    assert_eq!(info.input_latency, Duration::from_millis(2));

    // The first cycle also delivers the session snapshot, the second uses it.
    let input = vec![0.0; 200];
    driver.render_with_input(200, &input);
    assert_eq!(stamp.load(Ordering::Relaxed), 0);
    driver.render_with_input(200, &input);
    assert_eq!(stamp.load(Ordering::Relaxed), 200 - 96);
}

#[test]
fn test_missing_input_reports_unavailable() {
    init_logger();
    let (backend, driver) = OfflineBackend::new();
    let engine = PetalMixEngine::new(desc().enable_input(true), backend).unwrap();
    engine.start().unwrap();

    let events = engine.poll_events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, PetalMixEvent::InputUnavailable { .. }))
    );
    assert_eq!(driver.render(8).len(), 16);
}

#[test]
fn test_latency_measured_after_start_reaches_input_stamps() {
    struct Stamp(Arc<AtomicU64>);

    impl AudioReceiver for Stamp {
        fn receive(&mut self, timestamp: u64, _: usize, _: &[f32]) {
            self.0.store(timestamp, Ordering::Relaxed);
        }
    }

    init_logger();
    let (backend, driver) = OfflineBackend::new();
    driver.set_input_channels(1);
    let engine = PetalMixEngine::new(desc().enable_input(true), backend).unwrap();
    let stamp = Arc::new(AtomicU64::new(u64::MAX));
    engine
        .add_input_callback(&[0], Callback::receiver(Stamp(stamp.clone())))
        .unwrap();
    engine.start().unwrap();
    assert_eq!(engine.session_info().input_latency, Duration::ZERO);

    let input = vec![0.0; 200];
    driver.render_with_input(200, &input);
    assert_eq!(stamp.load(Ordering::Relaxed), 0);

    // The device reports its latency only once audio is flowing.
    driver.set_latencies(Duration::from_millis(10), Duration::from_millis(2));
    engine.poll_events();
    assert_eq!(engine.session_info().input_latency, Duration::from_millis(2));

    // One cycle delivers the new snapshot, the next one stamps with it.
    driver.render_with_input(200, &input);
    assert_eq!(stamp.load(Ordering::Relaxed), 200);
    driver.render_with_input(200, &input);
    assert_eq!(stamp.load(Ordering::Relaxed), 400 - 96);
}
