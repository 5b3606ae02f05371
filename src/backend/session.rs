use super::AudioBackend;
use crate::render::SessionSnapshot;
use std::time::Duration;

/// Device timing reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub output_latency: Duration,
    pub input_latency: Duration,
    pub buffer_duration: Duration,
}

impl SessionInfo {
    /// Latencies converted to frames at `sample_rate`, for the render thread.
    pub fn snapshot(&self, sample_rate: u32) -> SessionSnapshot {
        let frames = |latency: Duration| (latency.as_secs_f64() * f64::from(sample_rate)).round() as u64;
        SessionSnapshot {
            output_latency_frames: frames(self.output_latency),
            input_latency_frames: frames(self.input_latency),
        }
    }
}

/// Cache of [`SessionInfo`].
///
/// Querying a device can be slow, so values are fetched once and reused until
/// [`invalidate`](Self::invalidate) is called (after a start, a route change or a
/// recovery).
#[derive(Debug, Default)]
pub struct SessionState {
    cached: Option<SessionInfo>,
    queries: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, backend: &dyn AudioBackend) -> SessionInfo {
        if let Some(info) = self.cached {
            return info;
        }
        let info = SessionInfo {
            output_latency: backend.output_latency(),
            input_latency: backend.input_latency(),
            buffer_duration: backend.buffer_duration(),
        };
        self.queries += 1;
        log::debug!("Session info refreshed: {:?}", info);
        self.cached = Some(info);
        info
    }

    /// Replaces a cached reading taken before the device had measured any latency.
    ///
    /// Devices report latency from their first callbacks, so a reading taken right
    /// after start is often all zeros. Returns the fresh info once the backend
    /// reports a nonzero latency; `None` while nothing changed.
    pub fn settle(&mut self, backend: &dyn AudioBackend) -> Option<SessionInfo> {
        let cached = self.cached?;
        if !cached.output_latency.is_zero() || !cached.input_latency.is_zero() {
            return None;
        }
        if backend.output_latency().is_zero() && backend.input_latency().is_zero() {
            return None;
        }
        self.invalidate();
        Some(self.info(backend))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Number of times the backend has actually been queried.
    pub fn queries(&self) -> u64 {
        self.queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;

    #[test]
    fn test_values_are_cached_until_invalidated() {
        let (backend, driver) = OfflineBackend::new();
        driver.set_latencies(Duration::from_millis(5), Duration::from_millis(2));
        let mut session = SessionState::new();

        let first = session.info(&backend);
        assert_eq!(first.output_latency, Duration::from_millis(5));

        driver.set_latencies(Duration::from_millis(9), Duration::from_millis(2));
        assert_eq!(session.info(&backend), first);
        assert_eq!(session.queries(), 1);

        session.invalidate();
        assert_eq!(session.info(&backend).output_latency, Duration::from_millis(9));
        assert_eq!(session.queries(), 2);
    }

    #[test]
    fn test_settle_replaces_unmeasured_reading() {
        let (backend, driver) = OfflineBackend::new();
        let mut session = SessionState::new();
        assert!(session.settle(&backend).is_none());

        session.info(&backend);
        assert!(session.settle(&backend).is_none());

        driver.set_latencies(Duration::from_millis(4), Duration::from_millis(1));
        let settled = session.settle(&backend).unwrap();
        assert_eq!(settled.input_latency, Duration::from_millis(1));
        assert_eq!(session.queries(), 2);

        driver.set_latencies(Duration::from_millis(8), Duration::from_millis(3));
        assert!(session.settle(&backend).is_none());
        assert_eq!(session.info(&backend), settled);
    }

    #[test]
    fn test_snapshot_in_frames() {
        let info = SessionInfo {
            output_latency: Duration::from_millis(10),
            input_latency: Duration::from_millis(5),
            buffer_duration: Duration::from_millis(10),
        };
        let snapshot = info.snapshot(48000);
        assert_eq!(snapshot.output_latency_frames, 480);
        assert_eq!(snapshot.input_latency_frames, 240);
    }
}
