use petalmix::bridge::{BridgeConfig, MessageBridge, SyncOutcome};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(capacity: usize) -> BridgeConfig {
    BridgeConfig {
        capacity,
        sync_timeout: Duration::from_millis(500),
        sync_poll_interval: Duration::from_micros(200),
        idle_poll_interval: Duration::from_millis(50),
        active_poll_interval: Duration::from_millis(5),
    }
}

proptest! {
    /// Responses run in the order their requests were queued, however the render
    /// side's drains are interleaved with the sends.
    #[test]
    fn responses_preserve_enqueue_order(drain_points in prop::collection::vec(any::<bool>(), 1..64)) {
        let bridge = MessageBridge::new(Vec::<usize>::new(), config(128));
        bridge.set_render_active(true);
        let handle = bridge.render_handle();
        let observed = Arc::new(Mutex::new(Vec::new()));

        for (index, drain_now) in drain_points.iter().enumerate() {
            let seen = observed.clone();
            bridge
                .send_async(
                    Some(Box::new(move |state: &mut Vec<usize>| state.push(index))),
                    Some(Box::new(move || seen.lock().unwrap().push(index))),
                    None,
                )
                .unwrap();
            if *drain_now {
                handle.try_with(|side| side.drain()).unwrap();
                bridge.poll_control_side();
            }
        }
        handle.try_with(|side| side.drain()).unwrap();
        bridge.poll_control_side();

        let expected: Vec<usize> = (0..drain_points.len()).collect();
        prop_assert_eq!(&*observed.lock().unwrap(), &expected);
        prop_assert_eq!(handle.try_with(|side| side.state().clone()).unwrap(), expected);
        prop_assert_eq!(bridge.pending_responses(), 0);
    }

    /// A task carrying a payload of any size up to the ring's limit executes exactly
    /// once after one drain.
    #[test]
    fn one_drain_executes_each_task_once(payload_len in 0usize..4096, copies in 1usize..16) {
        let bridge = MessageBridge::new(0usize, config(16));
        bridge.set_render_active(true);
        let handle = bridge.render_handle();

        for _ in 0..copies {
            let payload = vec![1u8; payload_len];
            bridge
                .send_async(
                    Some(Box::new(move |runs: &mut usize| {
                        *runs += 1;
                        let _ = payload.len();
                    })),
                    None,
                    None,
                )
                .unwrap();
        }

        prop_assert_eq!(handle.try_with(|side| side.drain()), Some(copies));
        prop_assert_eq!(handle.try_with(|side| *side.state()), Some(copies));
        prop_assert_eq!(handle.try_with(|side| side.drain()), Some(0));
    }
}

#[test]
fn test_render_never_waits_for_a_control_thread() {
    init_logger();
    let bridge = MessageBridge::new(0u32, config(16));
    let handle = bridge.render_handle();
    let barrier = Arc::new(Barrier::new(2));

    let holder = {
        let bridge = bridge.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            bridge.with_render_state(|_| {
                barrier.wait();
                thread::sleep(Duration::from_millis(300));
            })
        })
    };

    barrier.wait();
    let started = Instant::now();
    let acquired = handle.try_with(|side| side.drain());
    let elapsed = started.elapsed();

    assert!(acquired.is_none());
    assert!(elapsed < Duration::from_millis(100), "render side waited {:?}", elapsed);
    holder.join().unwrap();
}

#[test]
fn test_sync_send_while_stopped_completes_in_place() {
    init_logger();
    let bridge = MessageBridge::new(false, config(16));
    assert!(!bridge.is_render_active());

    let outcome = bridge.send_sync(|flag: &mut bool| *flag = true).unwrap();
    assert_eq!(outcome, SyncOutcome::Completed);
    assert_eq!(bridge.with_render_state(|flag| *flag), Some(true));
}

#[test]
fn test_sync_send_served_by_render_thread() {
    init_logger();
    let bridge = MessageBridge::new(0u32, config(16));
    bridge.set_render_active(true);
    let handle = bridge.render_handle();
    let running = Arc::new(AtomicBool::new(true));

    let render = {
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                handle.try_with(|side| side.drain());
                thread::sleep(Duration::from_micros(500));
            }
        })
    };

    for _ in 0..10 {
        let outcome = bridge.send_sync(|count: &mut u32| *count += 1).unwrap();
        assert_eq!(outcome, SyncOutcome::Completed);
    }
    running.store(false, Ordering::Relaxed);
    render.join().unwrap();

    bridge.set_render_active(false);
    assert_eq!(bridge.with_render_state(|count| *count), Some(10));
    assert_eq!(bridge.timeout_count(), 0);
}
