//! Error-detection engine (C10), replicating the rolling-window restart
//! algorithm from the original `ar_util_err_detection.c`: OPEN/CLOSE
//! timeouts are always fatal, other timeouts and duplicate-ID errors each
//! accumulate in their own window, and restarts are globally rate-limited.

use std::time::{Duration, Instant};

/// Generic-timeout restart threshold within `ACCUMULATION_PERIOD`.
pub const MAX_TIMEOUTS_IN_PERIOD: u32 = 7;
/// Window length both rolling counters accumulate within.
pub const ACCUMULATION_PERIOD: Duration = Duration::from_secs(30);
/// Duplicate-error restart threshold within `ACCUMULATION_PERIOD`.
pub const MAX_DUPLICATE_IN_PERIOD: u32 = 60;
/// Minimum time since the last restart before a duplicate-error restart is
/// allowed to fire again.
pub const MIN_TIME_EDUPLICATE_RESTART_MS: Duration = Duration::from_secs(10 * 60);
/// Minimum time since the last restart before *any* restart decision is
/// honored, regardless of which rule triggered it.
pub const MIN_TIME_ANY_RESTART_MS: Duration = Duration::from_secs(60);

struct Window {
    first_seen: Option<Instant>,
    count: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            first_seen: None,
            count: 0,
        }
    }

    /// Records one occurrence at `now`, resetting the window if the
    /// previous first-seen timestamp has aged out of the accumulation
    /// period, overflow-safely saturating the count.
    fn record(&mut self, now: Instant) -> u32 {
        match self.first_seen {
            Some(first) if now.duration_since(first) <= ACCUMULATION_PERIOD => {
                self.count = self.count.saturating_add(1);
            }
            _ => {
                self.first_seen = Some(now);
                self.count = 1;
            }
        }
        self.count
    }
}

/// The kind of error event being reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEvent {
    /// A GRAPH_OPEN or GRAPH_CLOSE command timed out — always fatal.
    OpenOrCloseTimeout,
    /// Any other opcode timed out.
    GenericTimeout,
    /// The satellite reported a duplicate-command error.
    DuplicateCommand,
}

/// What the engine decided to do with an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No restart warranted (yet).
    Ignore,
    /// Trigger a restart of the affected master-proc context.
    Restart,
}

/// Per master-proc-context rolling state. One instance guards one
/// processor domain's restart decisions.
pub struct ErrorDetector {
    last_restart: Option<Instant>,
    generic_timeouts: Window,
    duplicates: Window,
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorDetector {
    pub fn new() -> Self {
        Self {
            last_restart: None,
            generic_timeouts: Window::new(),
            duplicates: Window::new(),
        }
    }

    /// Reports `event` at `now` and returns the engine's decision,
    /// recording a restart internally whenever it decides to fire.
    pub fn report(&mut self, event: ErrorEvent, now: Instant) -> Decision {
        let decision = match event {
            ErrorEvent::OpenOrCloseTimeout => Decision::Restart,
            ErrorEvent::GenericTimeout => {
                let count = self.generic_timeouts.record(now);
                if count >= MAX_TIMEOUTS_IN_PERIOD {
                    Decision::Restart
                } else {
                    Decision::Ignore
                }
            }
            ErrorEvent::DuplicateCommand => {
                let count = self.duplicates.record(now);
                let cooldown_elapsed = self
                    .last_restart
                    .is_none_or(|t| now.duration_since(t) > MIN_TIME_EDUPLICATE_RESTART_MS);
                if count >= MAX_DUPLICATE_IN_PERIOD && cooldown_elapsed {
                    Decision::Restart
                } else {
                    Decision::Ignore
                }
            }
        };

        if decision == Decision::Restart {
            let globally_rate_limited = self
                .last_restart
                .is_some_and(|t| now.duration_since(t) < MIN_TIME_ANY_RESTART_MS);
            if globally_rate_limited {
                tracing::warn!(?event, "restart decision suppressed by global rate limit");
                return Decision::Ignore;
            }
            self.last_restart = Some(now);
            tracing::error!(?event, "triggering subsystem restart");
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_timeout_always_restarts() {
        let mut det = ErrorDetector::new();
        let now = Instant::now();
        assert_eq!(det.report(ErrorEvent::OpenOrCloseTimeout, now), Decision::Restart);
    }

    #[test]
    fn generic_timeout_restarts_after_threshold() {
        let mut det = ErrorDetector::new();
        let now = Instant::now();
        for _ in 0..MAX_TIMEOUTS_IN_PERIOD - 1 {
            assert_eq!(det.report(ErrorEvent::GenericTimeout, now), Decision::Ignore);
        }
        assert_eq!(det.report(ErrorEvent::GenericTimeout, now), Decision::Restart);
    }

    #[test]
    fn stale_window_resets_count() {
        let mut det = ErrorDetector::new();
        let t0 = Instant::now();
        for _ in 0..MAX_TIMEOUTS_IN_PERIOD - 1 {
            det.report(ErrorEvent::GenericTimeout, t0);
        }
        let t1 = t0 + ACCUMULATION_PERIOD + Duration::from_secs(1);
        // Window reset: needs a fresh run of MAX_TIMEOUTS_IN_PERIOD, so this
        // single report should not yet restart.
        assert_eq!(det.report(ErrorEvent::GenericTimeout, t1), Decision::Ignore);
    }

    #[test]
    fn duplicate_restart_requires_both_count_and_cooldown() {
        let mut det = ErrorDetector::new();
        let t0 = Instant::now();
        for _ in 0..MAX_DUPLICATE_IN_PERIOD - 1 {
            det.report(ErrorEvent::DuplicateCommand, t0);
        }
        // Count threshold reached, but no prior restart means the 10-minute
        // cooldown check passes trivially (never restarted => elapsed).
        assert_eq!(det.report(ErrorEvent::DuplicateCommand, t0), Decision::Restart);
    }

    #[test]
    fn any_restart_globally_rate_limited() {
        let mut det = ErrorDetector::new();
        let t0 = Instant::now();
        assert_eq!(det.report(ErrorEvent::OpenOrCloseTimeout, t0), Decision::Restart);
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(det.report(ErrorEvent::OpenOrCloseTimeout, t1), Decision::Ignore);
        let t2 = t0 + MIN_TIME_ANY_RESTART_MS + Duration::from_secs(1);
        assert_eq!(det.report(ErrorEvent::OpenOrCloseTimeout, t2), Decision::Restart);
    }
}
