use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Quota numbers the platform enforces but does not fully document. They
/// were tuned by observation, which is why they are settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub quota_per_window: u32,
    pub window: Duration,
    pub safety_margin: Duration,
    pub failure_threshold: usize,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            quota_per_window: 100,
            window: Duration::from_secs(15 * 60),
            safety_margin: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    /// Wait this long, then retry. `rate_per_window` is the throughput seen
    /// so far, in uploads per quota window.
    Pause {
        duration: Duration,
        rate_per_window: f64,
    },
    /// Too many failures in a row: the quota is spent, stop the run.
    Abort { failures: usize },
}

/// Counts consecutive failures across all workers and turns each new one
/// into a pause or an abort.
#[derive(Debug)]
pub struct ThrottleController {
    settings: ThrottleSettings,
    consecutive_failures: AtomicUsize,
}

impl ThrottleController {
    pub fn new(settings: ThrottleSettings) -> Self {
        Self {
            settings,
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    pub fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Record a failed attempt. `elapsed` is the time since the run started,
    /// `uploaded` the number of successful uploads so far.
    pub fn on_failure(&self, elapsed: Duration, uploaded: usize) -> ThrottleDecision {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > self.settings.failure_threshold {
            return ThrottleDecision::Abort { failures };
        }
        ThrottleDecision::Pause {
            duration: self.pause_for(elapsed),
            rate_per_window: rate_per_window(uploaded, elapsed, self.settings.window),
        }
    }

    /// Time left until the next quota window boundary (windows are counted
    /// from the start of the run), plus the safety margin.
    pub fn pause_for(&self, elapsed: Duration) -> Duration {
        let window_ms = self.settings.window.as_millis();
        if window_ms == 0 {
            return self.settings.safety_margin;
        }
        let remaining_ms = window_ms - elapsed.as_millis() % window_ms;
        let remaining = Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(u64::MAX));
        remaining + self.settings.safety_margin
    }
}

/// Uploads per quota window at the rate observed so far.
pub fn rate_per_window(uploaded: usize, elapsed: Duration, window: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        return 0.0;
    }
    uploaded as f64 / secs * window.as_secs_f64()
}
