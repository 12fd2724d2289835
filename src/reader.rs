//! Channel readers — one blocking-read thread per monitored channel.
//!
//! Each reader owns one OS-level pipe handle, splits it into lines, stamps
//! every line with a per-channel sequence number and an offset from run
//! start, and forwards it to the event loop over a bounded channel. The
//! bound keeps a pathologically chatty child from growing memory without
//! limit. On EOF or read error the reader sends a terminal marker and stops;
//! it never makes that call fatal on its own.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::matcher::PatternMatcher;

/// How many lines may queue per run before readers block.
pub const FORWARD_BUFFER: usize = 1024;

/// Identity of one monitored channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    Stdout,
    Stderr,
    /// An extra numbered descriptor the child writes to (>= 3).
    Fd(u32),
    /// Our own standard input, in pipe mode.
    Stdin,
}

impl ChannelId {
    pub fn label(&self) -> String {
        match self {
            ChannelId::Stdout => "stdout".to_string(),
            ChannelId::Stderr => "stderr".to_string(),
            ChannelId::Fd(n) => format!("fd{n}"),
            ChannelId::Stdin => "stdin".to_string(),
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for ChannelId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// One monitored channel: identity, effective matcher, report label.
pub struct StreamSpec {
    pub id: ChannelId,
    pub label: String,
    pub matcher: std::sync::Arc<PatternMatcher>,
}

/// One line of output from a monitored channel.
#[derive(Debug, Clone, Serialize)]
pub struct LineEvent {
    pub channel: ChannelId,
    /// Per-channel sequence number, monotonic and gapless from 0.
    pub seq: u64,
    /// Offset since run start, in milliseconds.
    pub offset_ms: u64,
    pub content: String,
    /// Raw bytes consumed for this line, terminator included.
    pub bytes: u64,
    /// Filled in by the dispatcher.
    pub matched: bool,
}

/// Messages flowing from reader threads (and the signal handler) into the
/// single coordinating event loop.
pub enum ReaderMsg {
    Line(LineEvent),
    /// The channel reached EOF or failed; either way it is done.
    Eof {
        channel: ChannelId,
        error: Option<String>,
    },
    /// User interrupt — shut down cleanly.
    Cancelled,
}

/// Spawn the blocking-read thread for one channel.
///
/// The thread exits when the source reaches EOF, a read fails, or the event
/// loop has gone away (send fails after the decision is made).
pub fn spawn_reader<R: Read + Send + 'static>(
    channel: ChannelId,
    source: R,
    started: Instant,
    tx: SyncSender<ReaderMsg>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("read-{channel}"))
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut buf: Vec<u8> = Vec::with_capacity(256);
            let mut seq: u64 = 0;

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => {
                        debug!(%channel, lines = seq, "channel EOF");
                        let _ = tx.send(ReaderMsg::Eof {
                            channel,
                            error: None,
                        });
                        return;
                    }
                    Ok(n) => {
                        let event = LineEvent {
                            channel,
                            seq,
                            offset_ms: started.elapsed().as_millis() as u64,
                            content: decode_line(&buf),
                            bytes: n as u64,
                            matched: false,
                        };
                        seq += 1;
                        if tx.send(ReaderMsg::Line(event)).is_err() {
                            // Decision already made, loop gone.
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(%channel, error = %e, "channel read error, treating as EOF");
                        let _ = tx.send(ReaderMsg::Eof {
                            channel,
                            error: Some(e.to_string()),
                        });
                        return;
                    }
                }
            }
        })
        .expect("spawn reader thread")
}

/// Decode one raw line, dropping the terminator (`\n` or `\r\n`).
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
