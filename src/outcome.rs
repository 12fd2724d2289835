//! Run outcome — the one immutable result of an execution.
//!
//! The stable contract is the named [`ExitReason`]; numeric exit codes are a
//! thin presentation table so scripting conventions can be swapped without
//! touching the engine.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::reader::{ChannelId, LineEvent};

/// Why the run ended. Timeouts are first-class reasons, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// A monitored channel produced a line matching its pattern.
    Matched,
    /// The subject ended naturally without a match.
    CompletedNoMatch,
    /// The overall run-duration deadline fired.
    TimeoutOverall,
    /// No line arrived within the idle window.
    TimeoutIdle,
    /// No channel produced its first line in time.
    TimeoutFirstOutput,
    /// The child could not be started.
    SpawnError,
    /// User interrupt.
    Cancelled,
}

impl ExitReason {
    /// Stable machine name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Matched => "matched",
            ExitReason::CompletedNoMatch => "completed-no-match",
            ExitReason::TimeoutOverall => "timeout-overall",
            ExitReason::TimeoutIdle => "timeout-idle",
            ExitReason::TimeoutFirstOutput => "timeout-first-output",
            ExitReason::SpawnError => "spawn-error",
            ExitReason::Cancelled => "cancelled",
        }
    }

    /// Single-line human description, printed to stderr alongside the code.
    pub fn describe(&self) -> &'static str {
        match self {
            ExitReason::Matched => "pattern matched",
            ExitReason::CompletedNoMatch => "completed without match",
            ExitReason::TimeoutOverall => "overall timeout reached",
            ExitReason::TimeoutIdle => "idle timeout reached (output went quiet)",
            ExitReason::TimeoutFirstOutput => "no output before first-output timeout",
            ExitReason::SpawnError => "failed to start command",
            ExitReason::Cancelled => "interrupted",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExitReason::TimeoutOverall | ExitReason::TimeoutIdle | ExitReason::TimeoutFirstOutput
        )
    }
}

/// Exit-code conventions. `Standard` is the native contract; `Timeout`
/// mirrors GNU timeout's numbering for drop-in scripting compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExitStyle {
    #[default]
    Standard,
    Timeout,
}

impl ExitStyle {
    pub fn code_for(&self, reason: ExitReason) -> i32 {
        match self {
            ExitStyle::Standard => match reason {
                ExitReason::Matched => 0,
                ExitReason::CompletedNoMatch => 1,
                r if r.is_timeout() => 2,
                ExitReason::Cancelled => 130,
                _ => 3,
            },
            ExitStyle::Timeout => match reason {
                ExitReason::Matched => 0,
                ExitReason::CompletedNoMatch => 1,
                r if r.is_timeout() => 124,
                ExitReason::SpawnError => 126,
                ExitReason::Cancelled => 130,
                _ => 125,
            },
        }
    }

    /// Code for a configuration error, raised before any child is started.
    pub fn config_error_code(&self) -> i32 {
        match self {
            ExitStyle::Standard => 3,
            ExitStyle::Timeout => 125,
        }
    }
}

/// A confirmed match on one channel.
#[derive(Debug, Clone, Serialize)]
pub struct MatchEvent {
    pub channel: ChannelId,
    /// Sequence number of the matching line on its channel.
    pub seq: u64,
    pub offset_ms: u64,
    pub line: String,
    /// Byte span of the matched sub-string, absent for inverted matches.
    pub span: Option<(usize, usize)>,
    pub pattern: String,
}

/// Per-channel traffic totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStats {
    pub lines: u64,
    pub bytes: u64,
}

/// Timing summary, all offsets from run start.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimingSummary {
    pub first_output_ms: Option<u64>,
    pub first_match_ms: Option<u64>,
    pub total_ms: u64,
}

/// The immutable result of one run. Created exactly once, then read-only.
#[derive(Debug, Serialize)]
pub struct ExecutionOutcome {
    pub reason: ExitReason,
    pub exit_code: i32,
    /// The child's own exit code, when it was reaped.
    pub child_status: Option<i32>,
    /// Patterns in effect, keyed by channel label.
    pub patterns: BTreeMap<String, String>,
    /// Earliest real-time match across all channels, if any.
    pub matched: Option<MatchEvent>,
    pub matches: Vec<MatchEvent>,
    pub match_count: u64,
    /// The matching line plus the lines drained during the capture window.
    pub capture: Vec<LineEvent>,
    /// Traffic totals keyed by channel label.
    pub channels: BTreeMap<String, ChannelStats>,
    pub timing: TimingSummary,
    /// Detail for spawn failures.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_codes() {
        let s = ExitStyle::Standard;
        assert_eq!(s.code_for(ExitReason::Matched), 0);
        assert_eq!(s.code_for(ExitReason::CompletedNoMatch), 1);
        assert_eq!(s.code_for(ExitReason::TimeoutOverall), 2);
        assert_eq!(s.code_for(ExitReason::TimeoutIdle), 2);
        assert_eq!(s.code_for(ExitReason::TimeoutFirstOutput), 2);
        assert_eq!(s.code_for(ExitReason::SpawnError), 3);
        assert_eq!(s.code_for(ExitReason::Cancelled), 130);
    }

    #[test]
    fn timeout_style_matches_gnu_numbering() {
        let s = ExitStyle::Timeout;
        assert_eq!(s.code_for(ExitReason::Matched), 0);
        assert_eq!(s.code_for(ExitReason::TimeoutIdle), 124);
        assert_eq!(s.code_for(ExitReason::SpawnError), 126);
        assert_eq!(s.config_error_code(), 125);
    }

    #[test]
    fn reason_serializes_kebab_case() {
        let json = serde_json::to_string(&ExitReason::TimeoutFirstOutput).unwrap();
        assert_eq!(json, "\"timeout-first-output\"");
        assert_eq!(ExitReason::TimeoutFirstOutput.as_str(), "timeout-first-output");
    }
}
