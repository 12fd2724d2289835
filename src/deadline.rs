//! Timeout state machine.
//!
//! Coordinates four independent deadlines against one shared clock and
//! decides, exactly once, why the run ends.
//!
//! ## State machine
//!
//! ```text
//! ARMED           → first line on any channel   → STREAMING (first-output
//!                                                 deadline disarmed forever)
//! STREAMING       → line on any channel         → idle deadline rearms
//! STREAMING       → first match                 → MATCH_CAPTURING
//! MATCH_CAPTURING → time/line budget exhausted  → TERMINAL(matched)
//! any             → natural EOF on all channels → TERMINAL(completed / matched)
//! any             → deadline fires              → TERMINAL(timeout-*)
//! ```
//!
//! When deadlines fire within the same tick the order is deterministic:
//! match beats idle, idle beats first-output, first-output beats overall.
//! Once `Terminal` is reached every later signal is ignored.

use std::time::{Duration, Instant};

use crate::outcome::ExitReason;

/// The four deadline values. `None` means "unset" (infinite).
#[derive(Debug, Clone, Default)]
pub struct DeadlineConfig {
    /// Maximum total run duration regardless of output.
    pub overall: Option<Duration>,
    /// Maximum gap between consecutive lines on any monitored channel.
    pub idle: Option<Duration>,
    /// Maximum time before any channel produces its first line.
    pub first_output: Option<Duration>,
    /// Post-match capture window: extra draining time after the first match.
    pub capture_window: Option<Duration>,
    /// Post-match capture window: extra lines after the matching line.
    pub capture_lines: Option<u64>,
}

impl DeadlineConfig {
    /// An unconfigured capture budget is a zero budget: end on match.
    fn capture_is_zero(&self) -> bool {
        match (self.capture_window, self.capture_lines) {
            (None, None) => true,
            (Some(d), None) => d.is_zero(),
            (None, Some(n)) => n == 0,
            // Whichever is reached first wins, so either being zero ends it.
            (Some(d), Some(n)) => d.is_zero() || n == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No output seen yet; first-output and overall deadlines armed.
    Armed,
    /// Output flowing; idle rearms per line, overall still armed.
    Streaming,
    /// A match was seen; draining within the capture budget.
    MatchCapturing { since: Instant, lines: u64 },
    /// Decision made. Everything after this is ignored.
    Terminal(ExitReason),
}

/// Owns the deadlines and the single exit decision.
pub struct TimeoutController {
    config: DeadlineConfig,
    started: Instant,
    last_line: Instant,
    phase: Phase,
}

impl TimeoutController {
    pub fn new(config: DeadlineConfig, started: Instant) -> Self {
        Self {
            config,
            started,
            last_line: started,
            phase: Phase::Armed,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn decided(&self) -> Option<ExitReason> {
        match &self.phase {
            Phase::Terminal(reason) => Some(*reason),
            _ => None,
        }
    }

    /// A line arrived on some channel.
    ///
    /// Disarms first-output permanently on the first call, rearms idle, and
    /// inside the capture window counts the line against the line budget.
    /// Returns the decision if that budget is now exhausted.
    pub fn on_line(&mut self, at: Instant) -> Option<ExitReason> {
        self.last_line = at;
        match self.phase {
            Phase::Armed => {
                self.phase = Phase::Streaming;
                None
            }
            Phase::Streaming => None,
            Phase::MatchCapturing { since, lines } => {
                let lines = lines + 1;
                if self
                    .config
                    .capture_lines
                    .is_some_and(|budget| lines >= budget)
                {
                    return Some(self.finish(ExitReason::Matched));
                }
                self.phase = Phase::MatchCapturing { since, lines };
                None
            }
            Phase::Terminal(_) => None,
        }
    }

    /// The first confirmed match. Opens the capture window, or ends the run
    /// immediately on a zero budget. Later calls are ignored.
    pub fn on_match(&mut self, at: Instant) -> Option<ExitReason> {
        match self.phase {
            Phase::Armed | Phase::Streaming => {
                if self.config.capture_is_zero() {
                    Some(self.finish(ExitReason::Matched))
                } else {
                    self.phase = Phase::MatchCapturing {
                        since: at,
                        lines: 0,
                    };
                    None
                }
            }
            Phase::MatchCapturing { .. } | Phase::Terminal(_) => None,
        }
    }

    /// Every monitored channel reached EOF; nothing more can arrive.
    pub fn on_all_eof(&mut self) -> Option<ExitReason> {
        match self.phase {
            Phase::Armed | Phase::Streaming => Some(self.finish(ExitReason::CompletedNoMatch)),
            Phase::MatchCapturing { .. } => Some(self.finish(ExitReason::Matched)),
            Phase::Terminal(_) => None,
        }
    }

    /// User interrupt.
    pub fn cancel(&mut self) -> Option<ExitReason> {
        match self.phase {
            Phase::Terminal(_) => None,
            _ => Some(self.finish(ExitReason::Cancelled)),
        }
    }

    /// Evaluate every armed deadline at `now`, in priority order.
    pub fn poll(&mut self, now: Instant) -> Option<ExitReason> {
        match self.phase {
            Phase::Terminal(_) => return None,
            Phase::MatchCapturing { since, .. } => {
                // The match already won; only the capture clock matters here.
                let expired = self
                    .config
                    .capture_window
                    .is_some_and(|w| now.saturating_duration_since(since) >= w);
                if expired {
                    return Some(self.finish(ExitReason::Matched));
                }
                return None;
            }
            Phase::Streaming => {
                let idle_fired = self
                    .config
                    .idle
                    .is_some_and(|i| now.saturating_duration_since(self.last_line) >= i);
                if idle_fired {
                    return Some(self.finish(ExitReason::TimeoutIdle));
                }
            }
            Phase::Armed => {
                let first_fired = self
                    .config
                    .first_output
                    .is_some_and(|f| now.saturating_duration_since(self.started) >= f);
                if first_fired {
                    return Some(self.finish(ExitReason::TimeoutFirstOutput));
                }
            }
        }

        let overall_fired = self
            .config
            .overall
            .is_some_and(|o| now.saturating_duration_since(self.started) >= o);
        if overall_fired {
            return Some(self.finish(ExitReason::TimeoutOverall));
        }
        None
    }

    /// Time until the nearest armed deadline, for the event loop's sleep.
    pub fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        let mut nearest: Option<Duration> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                let remaining = d.saturating_duration_since(now);
                nearest = Some(match nearest {
                    Some(cur) => cur.min(remaining),
                    None => remaining,
                });
            }
        };

        match self.phase {
            Phase::Terminal(_) => return None,
            Phase::MatchCapturing { since, .. } => {
                consider(self.config.capture_window.map(|w| since + w));
                return nearest;
            }
            Phase::Streaming => {
                consider(self.config.idle.map(|i| self.last_line + i));
            }
            Phase::Armed => {
                consider(self.config.first_output.map(|f| self.started + f));
            }
        }
        consider(self.config.overall.map(|o| self.started + o));
        nearest
    }

    fn finish(&mut self, reason: ExitReason) -> ExitReason {
        self.phase = Phase::Terminal(reason);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn controller(config: DeadlineConfig) -> (TimeoutController, Instant) {
        let started = Instant::now();
        (TimeoutController::new(config, started), started)
    }

    #[test]
    fn first_line_disarms_first_output_forever() {
        let (mut c, t0) = controller(DeadlineConfig {
            first_output: Some(secs(3)),
            ..Default::default()
        });
        assert!(c.on_line(t0 + secs(1)).is_none());
        assert_eq!(*c.phase(), Phase::Streaming);
        // Long past the first-output window, but it never rearms.
        assert!(c.poll(t0 + secs(60)).is_none());
    }

    #[test]
    fn first_output_timeout_fires_while_armed() {
        let (mut c, t0) = controller(DeadlineConfig {
            first_output: Some(secs(3)),
            overall: Some(secs(10)),
            ..Default::default()
        });
        assert!(c.poll(t0 + secs(2)).is_none());
        assert_eq!(c.poll(t0 + secs(3)), Some(ExitReason::TimeoutFirstOutput));
        // The decision was made; later polls are silent.
        assert!(c.poll(t0 + secs(20)).is_none());
        assert_eq!(c.decided(), Some(ExitReason::TimeoutFirstOutput));
    }

    #[test]
    fn idle_rearms_on_every_line() {
        let (mut c, t0) = controller(DeadlineConfig {
            idle: Some(secs(2)),
            ..Default::default()
        });
        c.on_line(t0 + secs(1));
        assert!(c.poll(t0 + secs(2)).is_none());
        c.on_line(t0 + secs(2));
        assert!(c.poll(t0 + Duration::from_millis(3900)).is_none());
        assert_eq!(c.poll(t0 + secs(4)), Some(ExitReason::TimeoutIdle));
    }

    #[test]
    fn overall_fires_regardless_of_output_volume() {
        let (mut c, t0) = controller(DeadlineConfig {
            overall: Some(secs(5)),
            idle: Some(secs(10)),
            ..Default::default()
        });
        for i in 0..5 {
            c.on_line(t0 + secs(i));
        }
        assert_eq!(c.poll(t0 + secs(5)), Some(ExitReason::TimeoutOverall));
    }

    #[test]
    fn idle_beats_overall_in_the_same_tick() {
        let (mut c, t0) = controller(DeadlineConfig {
            overall: Some(secs(5)),
            idle: Some(secs(5)),
            ..Default::default()
        });
        c.on_line(t0);
        assert_eq!(c.poll(t0 + secs(5)), Some(ExitReason::TimeoutIdle));
    }

    #[test]
    fn first_output_beats_overall_in_the_same_tick() {
        let (mut c, t0) = controller(DeadlineConfig {
            overall: Some(secs(5)),
            first_output: Some(secs(5)),
            ..Default::default()
        });
        assert_eq!(c.poll(t0 + secs(5)), Some(ExitReason::TimeoutFirstOutput));
    }

    #[test]
    fn zero_capture_budget_ends_on_match() {
        let (mut c, t0) = controller(DeadlineConfig::default());
        c.on_line(t0);
        assert_eq!(c.on_match(t0), Some(ExitReason::Matched));
    }

    #[test]
    fn capture_line_budget_counts_lines_after_the_match() {
        let (mut c, t0) = controller(DeadlineConfig {
            capture_lines: Some(2),
            ..Default::default()
        });
        c.on_line(t0);
        assert!(c.on_match(t0).is_none());
        assert!(c.on_line(t0 + secs(1)).is_none());
        assert_eq!(c.on_line(t0 + secs(2)), Some(ExitReason::Matched));
    }

    #[test]
    fn capture_time_budget_expires() {
        let (mut c, t0) = controller(DeadlineConfig {
            capture_window: Some(secs(2)),
            ..Default::default()
        });
        c.on_line(t0);
        c.on_match(t0 + secs(1));
        assert!(c.poll(t0 + secs(2)).is_none());
        assert_eq!(c.poll(t0 + secs(3)), Some(ExitReason::Matched));
    }

    #[test]
    fn capture_ends_on_whichever_budget_hits_first() {
        let (mut c, t0) = controller(DeadlineConfig {
            capture_window: Some(secs(1)),
            capture_lines: Some(100),
            ..Default::default()
        });
        c.on_line(t0);
        c.on_match(t0);
        c.on_line(t0 + Duration::from_millis(500));
        assert_eq!(c.poll(t0 + secs(1)), Some(ExitReason::Matched));
    }

    #[test]
    fn match_beats_pending_idle_timeout() {
        let (mut c, t0) = controller(DeadlineConfig {
            idle: Some(secs(2)),
            ..Default::default()
        });
        c.on_line(t0);
        // Match and idle expiry land in the same tick; match wins.
        c.on_match(t0 + secs(2));
        assert_eq!(c.decided(), Some(ExitReason::Matched));
    }

    #[test]
    fn idle_and_overall_ignored_inside_capture_window() {
        let (mut c, t0) = controller(DeadlineConfig {
            idle: Some(secs(1)),
            overall: Some(secs(2)),
            capture_window: Some(secs(10)),
            ..Default::default()
        });
        c.on_line(t0);
        c.on_match(t0);
        // Both idle and overall are long past; the capture clock governs.
        assert!(c.poll(t0 + secs(5)).is_none());
        assert_eq!(c.poll(t0 + secs(10)), Some(ExitReason::Matched));
    }

    #[test]
    fn eof_before_match_is_completed_no_match() {
        let (mut c, t0) = controller(DeadlineConfig::default());
        c.on_line(t0);
        assert_eq!(c.on_all_eof(), Some(ExitReason::CompletedNoMatch));
    }

    #[test]
    fn eof_during_capture_window_is_still_matched() {
        let (mut c, t0) = controller(DeadlineConfig {
            capture_lines: Some(100),
            ..Default::default()
        });
        c.on_line(t0);
        c.on_match(t0);
        assert_eq!(c.on_all_eof(), Some(ExitReason::Matched));
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let (mut c, t0) = controller(DeadlineConfig::default());
        c.on_line(t0);
        assert_eq!(c.cancel(), Some(ExitReason::Cancelled));
        assert!(c.cancel().is_none());
        assert!(c.on_all_eof().is_none());
    }

    #[test]
    fn next_wakeup_tracks_the_nearest_deadline() {
        let (mut c, t0) = controller(DeadlineConfig {
            overall: Some(secs(10)),
            idle: Some(secs(2)),
            first_output: Some(secs(5)),
            ..Default::default()
        });
        // Armed: first-output (5s) is nearer than overall (10s).
        assert_eq!(c.next_wakeup(t0), Some(secs(5)));
        c.on_line(t0 + secs(1));
        // Streaming: idle expires at t=3.
        assert_eq!(c.next_wakeup(t0 + secs(1)), Some(secs(2)));
        c.poll(t0 + secs(3));
        assert_eq!(c.next_wakeup(t0 + secs(4)), None);
    }
}
