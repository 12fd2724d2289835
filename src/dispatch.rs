//! Line dispatch — per-channel matching and the single "matched" signal.
//!
//! Consumes lines from every reader in real-time arrival order, applies the
//! matcher bound to the line's channel, and raises the matched signal exactly
//! once, even when several channels match near-simultaneously. The first
//! match in arrival order is the run's matched line; an idempotent guard
//! keeps later matches from touching it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::matcher::PatternMatcher;
use crate::outcome::{ChannelStats, MatchEvent};
use crate::reader::{ChannelId, LineEvent, StreamSpec};

/// What dispatching one line produced.
pub struct Dispatched {
    /// The line, with its matched flag filled in.
    pub event: LineEvent,
    /// True exactly once per run: this line raised the matched signal.
    pub first_match: bool,
}

pub struct Dispatcher {
    matchers: HashMap<ChannelId, Arc<PatternMatcher>>,
    stats: BTreeMap<ChannelId, ChannelStats>,
    matches: Vec<MatchEvent>,
    matched: Option<MatchEvent>,
    capture: Vec<LineEvent>,
    first_output_ms: Option<u64>,
    first_match_ms: Option<u64>,
}

impl Dispatcher {
    pub fn new(specs: &[StreamSpec]) -> Self {
        let matchers = specs
            .iter()
            .map(|s| (s.id, Arc::clone(&s.matcher)))
            .collect();
        let stats = specs
            .iter()
            .map(|s| (s.id, ChannelStats::default()))
            .collect();
        Self {
            matchers,
            stats,
            matches: Vec::new(),
            matched: None,
            capture: Vec::new(),
            first_output_ms: None,
            first_match_ms: None,
        }
    }

    /// Dispatch one line: update traffic stats, run the channel's matcher,
    /// record any match, and append to the capture tail once a match exists.
    pub fn on_line(&mut self, mut event: LineEvent) -> Dispatched {
        if self.first_output_ms.is_none() {
            self.first_output_ms = Some(event.offset_ms);
        }
        let stats = self.stats.entry(event.channel).or_default();
        stats.lines += 1;
        stats.bytes += event.bytes;

        let mut first_match = false;
        if let Some(matcher) = self.matchers.get(&event.channel) {
            let result = matcher.check(&event.content);
            event.matched = result.matched;
            if result.matched {
                let record = MatchEvent {
                    channel: event.channel,
                    seq: event.seq,
                    offset_ms: event.offset_ms,
                    line: event.content.clone(),
                    span: result.span,
                    pattern: matcher.pattern_str().to_string(),
                };
                // First-writer-wins guard: nothing overwrites the matched
                // line once it is set.
                if self.matched.is_none() {
                    debug!(channel = %event.channel, line = %event.content, "pattern matched");
                    self.matched = Some(record.clone());
                    self.first_match_ms = Some(event.offset_ms);
                    first_match = true;
                }
                self.matches.push(record);
            }
        }

        if self.matched.is_some() {
            self.capture.push(event.clone());
        }

        Dispatched { event, first_match }
    }

    pub fn matched(&self) -> Option<&MatchEvent> {
        self.matched.as_ref()
    }

    pub fn match_count(&self) -> u64 {
        self.matches.len() as u64
    }

    pub fn first_output_ms(&self) -> Option<u64> {
        self.first_output_ms
    }

    /// Tear down into the pieces the outcome needs.
    pub fn into_parts(self) -> DispatchParts {
        DispatchParts {
            matched: self.matched,
            matches: self.matches,
            capture: self.capture,
            stats: self.stats,
            first_output_ms: self.first_output_ms,
            first_match_ms: self.first_match_ms,
        }
    }
}

pub struct DispatchParts {
    pub matched: Option<MatchEvent>,
    pub matches: Vec<MatchEvent>,
    pub capture: Vec<LineEvent>,
    pub stats: BTreeMap<ChannelId, ChannelStats>,
    pub first_output_ms: Option<u64>,
    pub first_match_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchOptions;

    fn spec(id: ChannelId, pattern: &str) -> StreamSpec {
        StreamSpec {
            id,
            label: id.label(),
            matcher: Arc::new(PatternMatcher::new(pattern, &[], MatchOptions::default()).unwrap()),
        }
    }

    fn line(channel: ChannelId, seq: u64, offset_ms: u64, content: &str) -> LineEvent {
        LineEvent {
            channel,
            seq,
            offset_ms,
            content: content.to_string(),
            bytes: content.len() as u64 + 1,
            matched: false,
        }
    }

    #[test]
    fn first_arrival_order_match_wins_across_channels() {
        let specs = vec![
            spec(ChannelId::Stdout, "FAIL"),
            spec(ChannelId::Stderr, "CRASH"),
        ];
        let mut d = Dispatcher::new(&specs);

        // Stderr matches first in real time, stdout later.
        let r1 = d.on_line(line(ChannelId::Stderr, 0, 1000, "CRASH now"));
        assert!(r1.first_match);
        let r2 = d.on_line(line(ChannelId::Stdout, 0, 2000, "FAIL later"));
        assert!(!r2.first_match);
        assert!(r2.event.matched);

        let matched = d.matched().unwrap();
        assert_eq!(matched.channel, ChannelId::Stderr);
        assert_eq!(matched.line, "CRASH now");
        assert_eq!(matched.offset_ms, 1000);
        assert_eq!(d.match_count(), 2);
    }

    #[test]
    fn per_channel_override_applies() {
        let specs = vec![
            spec(ChannelId::Stdout, "ERROR"),
            spec(ChannelId::Stderr, "panic"),
        ];
        let mut d = Dispatcher::new(&specs);

        // The stdout pattern must not fire on stderr traffic.
        let r = d.on_line(line(ChannelId::Stderr, 0, 10, "ERROR-ish noise on stderr"));
        assert!(!r.event.matched);
        let r = d.on_line(line(ChannelId::Stderr, 1, 20, "thread panic"));
        assert!(r.event.matched);
    }

    #[test]
    fn capture_tail_starts_at_the_matching_line() {
        let specs = vec![spec(ChannelId::Stdout, "ERROR")];
        let mut d = Dispatcher::new(&specs);

        d.on_line(line(ChannelId::Stdout, 0, 0, "before"));
        d.on_line(line(ChannelId::Stdout, 1, 1, "ERROR: bad"));
        d.on_line(line(ChannelId::Stdout, 2, 2, "after1"));

        let parts = d.into_parts();
        let tail: Vec<&str> = parts.capture.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(tail, vec!["ERROR: bad", "after1"]);
    }

    #[test]
    fn stats_and_timing_accumulate() {
        let specs = vec![spec(ChannelId::Stdout, "nope")];
        let mut d = Dispatcher::new(&specs);

        d.on_line(line(ChannelId::Stdout, 0, 120, "aaa"));
        d.on_line(line(ChannelId::Stdout, 1, 250, "bbbb"));

        assert_eq!(d.first_output_ms(), Some(120));
        let parts = d.into_parts();
        assert_eq!(parts.first_match_ms, None);
        let s = parts.stats[&ChannelId::Stdout];
        assert_eq!(s.lines, 2);
        assert_eq!(s.bytes, 4 + 5);
    }

    #[test]
    fn unknown_channel_lines_count_but_never_match() {
        let specs = vec![spec(ChannelId::Stdout, ".*")];
        let mut d = Dispatcher::new(&specs);

        let r = d.on_line(line(ChannelId::Fd(7), 0, 5, "stray"));
        assert!(!r.event.matched);
        assert!(!r.first_match);
    }
}
