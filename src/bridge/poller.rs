use super::MessageBridge;
use crossbeam_channel::{Sender, bounded, select};
use std::thread::{self, JoinHandle};

/// Background thread that services bridge responses nobody is waiting for.
///
/// Ticks at the bridge's idle interval, switches to the active interval while
/// responses are outstanding, and wakes immediately when a message with a response
/// is sent. Each tick polls the control side and then runs `on_tick`.
///
/// Dropping the poller stops the thread and joins it.
pub struct Poller {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn<S, F>(bridge: MessageBridge<S>, mut on_tick: F) -> std::io::Result<Self>
    where
        S: Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let wake = bridge.wake_receiver();

        let thread = thread::Builder::new()
            .name("petalmix-poller".into())
            .spawn(move || {
                log::debug!("Poller thread started");
                loop {
                    let interval = bridge.poll_interval();
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(wake) -> _ => {},
                        default(interval) => {},
                    }
                    bridge.poll_control_side();
                    on_tick();
                }
                log::debug!("Poller thread stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the select.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Poller thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_poller_services_unowned_responses() {
        let bridge = MessageBridge::new(0u32, BridgeConfig::default());
        bridge.set_render_active(true);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let poller = Poller::spawn(bridge.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(poller.is_running());

        let responded = Arc::new(AtomicBool::new(false));
        let flag = responded.clone();
        bridge
            .send_async(
                Some(Box::new(|count: &mut u32| *count += 1)),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
                None,
            )
            .unwrap();
        bridge.render_handle().try_with(|side| side.drain());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !responded.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(responded.load(Ordering::SeqCst));
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert_eq!(bridge.pending_responses(), 0);

        drop(poller);
    }
}
