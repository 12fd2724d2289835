//! Execution request — frozen configuration for one run.
//!
//! Validated before anything is spawned; every problem here is a
//! configuration error with its own exit code, and no child ever starts.
//! Freezing derives the per-channel `StreamSpec`s once; nothing about the
//! request mutates afterwards.

use std::sync::Arc;

use thiserror::Error;

use crate::deadline::DeadlineConfig;
use crate::matcher::{MatchOptions, PatternError, PatternMatcher};
use crate::reader::{ChannelId, StreamSpec};

/// Run a child process, or consume our own standard input.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Command { program: String, args: Vec<String> },
    Pipe,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("unknown channel {0:?} (expected stdout, stderr, or a descriptor >= 3)")]
    UnknownChannel(String),
    #[error("descriptor {0} is reserved (0-2 are stdin/stdout/stderr)")]
    ReservedDescriptor(u32),
    #[error("channel {0} listed more than once")]
    DuplicateChannel(ChannelId),
    #[error("pattern override targets unmonitored channel {0}")]
    OverrideForUnmonitored(ChannelId),
    #[error("extra descriptors make no sense in pipe mode")]
    ExtraFdsInPipeMode,
    #[error("extra descriptors are only supported on unix")]
    ExtraFdsUnsupported,
    #[error("no channels left to monitor")]
    NoChannels,
}

/// Which of the two standard streams to monitor by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StreamSelection {
    Stdout,
    Stderr,
    #[default]
    Both,
}

/// Frozen configuration for one run.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub mode: Mode,
    /// Default pattern, applied to every channel without an override.
    pub pattern: String,
    /// Per-channel pattern overrides.
    pub overrides: Vec<(ChannelId, String)>,
    /// Exclusion sub-patterns, shared by every matcher.
    pub exclusions: Vec<String>,
    pub options: MatchOptions,
    pub streams: StreamSelection,
    /// Extra numbered descriptors (>= 3) the child writes to.
    pub extra_fds: Vec<u32>,
    pub deadlines: DeadlineConfig,
}

impl ExecutionRequest {
    /// Parse a CLI channel name: `stdout`/`out`/`1`, `stderr`/`err`/`2`,
    /// or a bare descriptor number >= 3.
    pub fn parse_channel(name: &str) -> Result<ChannelId, ConfigError> {
        match name {
            "stdout" | "out" | "1" => Ok(ChannelId::Stdout),
            "stderr" | "err" | "2" => Ok(ChannelId::Stderr),
            other => match other.parse::<u32>() {
                Ok(n) if n >= 3 => Ok(ChannelId::Fd(n)),
                Ok(n) => Err(ConfigError::ReservedDescriptor(n)),
                Err(_) => Err(ConfigError::UnknownChannel(other.to_string())),
            },
        }
    }

    /// The set of channels this request monitors, in reporting order.
    pub fn channels(&self) -> Result<Vec<ChannelId>, ConfigError> {
        if matches!(self.mode, Mode::Pipe) {
            if !self.extra_fds.is_empty() {
                return Err(ConfigError::ExtraFdsInPipeMode);
            }
            return Ok(vec![ChannelId::Stdin]);
        }

        let mut out = Vec::new();
        match self.streams {
            StreamSelection::Stdout => out.push(ChannelId::Stdout),
            StreamSelection::Stderr => out.push(ChannelId::Stderr),
            StreamSelection::Both => {
                out.push(ChannelId::Stdout);
                out.push(ChannelId::Stderr);
            }
        }
        for &fd in &self.extra_fds {
            if fd < 3 {
                return Err(ConfigError::ReservedDescriptor(fd));
            }
            let id = ChannelId::Fd(fd);
            if out.contains(&id) {
                return Err(ConfigError::DuplicateChannel(id));
            }
            out.push(id);
        }
        if out.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        Ok(out)
    }

    /// Validate everything and derive one `StreamSpec` per channel.
    ///
    /// Channels without an override share one default matcher, so the
    /// match-count cap is accounted across them rather than per channel.
    pub fn freeze(&self) -> Result<Vec<StreamSpec>, ConfigError> {
        let channels = self.channels()?;

        for (id, _) in &self.overrides {
            if !channels.contains(id) {
                return Err(ConfigError::OverrideForUnmonitored(*id));
            }
        }

        let default = Arc::new(PatternMatcher::new(
            &self.pattern,
            &self.exclusions,
            self.options.clone(),
        )?);

        let mut specs = Vec::with_capacity(channels.len());
        for id in channels {
            let matcher = match self.overrides.iter().find(|(c, _)| *c == id) {
                Some((_, pattern)) => Arc::new(PatternMatcher::new(
                    pattern,
                    &self.exclusions,
                    self.options.clone(),
                )?),
                None => Arc::clone(&default),
            };
            specs.push(StreamSpec {
                id,
                label: id.label(),
                matcher,
            });
        }
        Ok(specs)
    }
}
