use std::time::{Duration, Instant};

/// Outcome of [`DiagnosticLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Log the message; `suppressed` identical messages were dropped before it.
    Log { suppressed: u64 },
    Suppress,
}

/// Burst suppression for repeated identical diagnostics.
///
/// The first `burst` occurrences of a message within `window` of each other are
/// logged; after that only every `sample_every`-th occurrence is, carrying the
/// number dropped in between. A different message or a quiet gap longer than
/// `window` starts over.
#[derive(Debug)]
pub struct DiagnosticLimiter {
    burst: u64,
    window: Duration,
    sample_every: u64,
    last: Option<String>,
    last_seen: Option<Instant>,
    repeats: u64,
    suppressed: u64,
}

impl Default for DiagnosticLimiter {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 50)
    }
}

impl DiagnosticLimiter {
    pub fn new(burst: u64, window: Duration, sample_every: u64) -> Self {
        Self {
            burst,
            window,
            sample_every: sample_every.max(1),
            last: None,
            last_seen: None,
            repeats: 0,
            suppressed: 0,
        }
    }

    pub fn check(&mut self, message: &str) -> LogDecision {
        self.check_at(message, Instant::now())
    }

    pub fn check_at(&mut self, message: &str, now: Instant) -> LogDecision {
        let in_burst = self.last.as_deref() == Some(message)
            && self
                .last_seen
                .is_some_and(|seen| now.saturating_duration_since(seen) <= self.window);
        self.last_seen = Some(now);

        if !in_burst {
            self.last = Some(message.to_string());
            self.repeats = 1;
            let suppressed = std::mem::take(&mut self.suppressed);
            return LogDecision::Log { suppressed };
        }

        self.repeats += 1;
        if self.repeats <= self.burst || (self.repeats - self.burst) % self.sample_every == 0 {
            LogDecision::Log {
                suppressed: std::mem::take(&mut self.suppressed),
            }
        } else {
            self.suppressed += 1;
            LogDecision::Suppress
        }
    }

    /// Logs `message` at error level unless it is being suppressed.
    pub fn error(&mut self, message: &str) {
        match self.check(message) {
            LogDecision::Log { suppressed: 0 } => log::error!("{}", message),
            LogDecision::Log { suppressed } => {
                log::error!("{} ({} similar messages suppressed)", message, suppressed)
            }
            LogDecision::Suppress => {}
        }
    }
}
