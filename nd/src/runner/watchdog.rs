//! Worker watchdogs
//!
//! Two timers run while a crawl job is non-terminal: the silence watchdog
//! (no output at all) and the progress watchdog (output flows but the
//! counter stopped advancing). Silence escalates to forced termination;
//! a stall never does. A third, one-shot check flags a slow start when the
//! worker produces no output at all within its startup budget.

use std::time::{Duration, Instant};

/// Watchdog thresholds
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// No output for this long raises a silence problem
    pub silence: Duration,
    /// Determinate progress frozen for this long raises a stall problem
    pub stall: Duration,
    /// No first output within this budget raises a slow-start problem
    pub first_output: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            silence: Duration::from_secs(120),
            stall: Duration::from_secs(300),
            first_output: Duration::from_secs(10),
        }
    }
}

/// What a tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAlert {
    /// Advisory: worker produced no output within the startup budget
    SlowStart { waited: Duration },
    /// Advisory: no output for the silence threshold
    Silence { waited: Duration },
    /// Terminal: silence reached twice the threshold; terminate the worker
    SilenceKill { waited: Duration },
    /// Advisory only: determinate progress stopped advancing
    Stall { waited: Duration },
}

/// Tracks output and progress recency for one worker
#[derive(Debug)]
pub struct WatchdogState {
    config: WatchdogConfig,
    started: Instant,
    last_output: Option<Instant>,
    last_advance: Instant,
    progress_current: u64,
    progress_total: u64,
    slow_start_flagged: bool,
    silence_flagged: bool,
    stall_flagged: bool,
}

impl WatchdogState {
    pub fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            started: now,
            last_output: None,
            last_advance: now,
            progress_current: 0,
            progress_total: 0,
            slow_start_flagged: false,
            silence_flagged: false,
            stall_flagged: false,
        }
    }

    /// Any line on stdout or stderr counts as output
    pub fn note_output(&mut self, now: Instant) {
        self.last_output = Some(now);
        self.silence_flagged = false;
    }

    /// A progress record; advancing the counter re-arms the stall watchdog
    pub fn note_progress(&mut self, current: u64, total: u64, now: Instant) {
        if current > self.progress_current || total != self.progress_total {
            self.last_advance = now;
            self.stall_flagged = false;
        }
        self.progress_current = current;
        self.progress_total = total;
    }

    /// Restart recency tracking (after resume from pause)
    pub fn reset(&mut self, now: Instant) {
        self.started = now;
        self.last_output = Some(now);
        self.last_advance = now;
        self.silence_flagged = false;
        self.stall_flagged = false;
    }

    /// Evaluate the watchdogs; called on a periodic tick
    pub fn tick(&mut self, now: Instant) -> Vec<WatchdogAlert> {
        let mut alerts = Vec::new();

        if self.last_output.is_none() && !self.slow_start_flagged {
            let waited = now.duration_since(self.started);
            if waited >= self.config.first_output {
                self.slow_start_flagged = true;
                alerts.push(WatchdogAlert::SlowStart { waited });
            }
        }

        let silent_since = self.last_output.unwrap_or(self.started);
        let silent_for = now.duration_since(silent_since);
        if silent_for >= self.config.silence * 2 {
            alerts.push(WatchdogAlert::SilenceKill { waited: silent_for });
        } else if silent_for >= self.config.silence && !self.silence_flagged {
            self.silence_flagged = true;
            alerts.push(WatchdogAlert::Silence { waited: silent_for });
        }

        if self.progress_total > 0 && !self.stall_flagged {
            let stalled_for = now.duration_since(self.last_advance);
            if stalled_for >= self.config.stall {
                self.stall_flagged = true;
                alerts.push(WatchdogAlert::Stall { waited: stalled_for });
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            silence: Duration::from_secs(10),
            stall: Duration::from_secs(30),
            first_output: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_quiet_worker_progresses_through_alerts() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);

        assert!(wd.tick(start + Duration::from_secs(1)).is_empty());

        // Slow start at 5s
        let alerts = wd.tick(start + Duration::from_secs(6));
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0], WatchdogAlert::SlowStart { .. }));

        // Silence at 10s (advisory, once)
        let alerts = wd.tick(start + Duration::from_secs(11));
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0], WatchdogAlert::Silence { .. }));
        assert!(wd.tick(start + Duration::from_secs(12)).is_empty());

        // Kill at 2x silence
        let alerts = wd.tick(start + Duration::from_secs(21));
        assert!(alerts.iter().any(|a| matches!(a, WatchdogAlert::SilenceKill { .. })));
    }

    #[test]
    fn test_output_rearms_silence() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);
        wd.note_output(start + Duration::from_secs(1));

        let alerts = wd.tick(start + Duration::from_secs(12));
        assert!(matches!(alerts[0], WatchdogAlert::Silence { .. }));

        // Output resumes; the silence flag re-arms
        wd.note_output(start + Duration::from_secs(13));
        assert!(wd.tick(start + Duration::from_secs(14)).is_empty());
        let alerts = wd.tick(start + Duration::from_secs(24));
        assert!(matches!(alerts[0], WatchdogAlert::Silence { .. }));
    }

    #[test]
    fn test_stall_requires_determinate_total() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);
        wd.note_output(start);
        wd.note_progress(5, 0, start);

        // Indeterminate progress never stalls; silence fires instead
        let alerts = wd.tick(start + Duration::from_secs(35));
        assert!(!alerts.iter().any(|a| matches!(a, WatchdogAlert::Stall { .. })));
    }

    #[test]
    fn test_stall_fires_once_and_rearms_on_advance() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);
        wd.note_progress(1, 10, start);

        // Keep output flowing so only the stall can fire
        wd.note_output(start + Duration::from_secs(29));
        let alerts = wd.tick(start + Duration::from_secs(31));
        assert!(alerts.iter().any(|a| matches!(a, WatchdogAlert::Stall { .. })));

        wd.note_output(start + Duration::from_secs(32));
        assert!(
            !wd.tick(start + Duration::from_secs(33))
                .iter()
                .any(|a| matches!(a, WatchdogAlert::Stall { .. }))
        );

        // Progress advances, then freezes again: a second stall fires
        wd.note_progress(2, 10, start + Duration::from_secs(34));
        wd.note_output(start + Duration::from_secs(63));
        let alerts = wd.tick(start + Duration::from_secs(65));
        assert!(alerts.iter().any(|a| matches!(a, WatchdogAlert::Stall { .. })));
    }

    #[test]
    fn test_reset_after_resume() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);
        wd.note_output(start);

        // Long pause would otherwise look like silence
        wd.reset(start + Duration::from_secs(100));
        assert!(wd.tick(start + Duration::from_secs(101)).is_empty());
    }

    #[test]
    fn test_early_output_suppresses_slow_start() {
        let start = Instant::now();
        let mut wd = WatchdogState::new(config(), start);
        wd.note_output(start + Duration::from_secs(1));
        assert!(wd.tick(start + Duration::from_secs(6)).is_empty());
    }
}
