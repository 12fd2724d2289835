//! Run lifecycle — spawn, monitor, decide, shut down.
//!
//! The orchestrator owns the whole run: it freezes the request, starts the
//! child (or attaches to stdin in pipe mode), runs one reader thread per
//! monitored channel, and drives the single coordinating event loop that
//! feeds the dispatcher and the timeout controller. The loop is the only
//! writer of the decision, so "first condition wins" needs no further
//! synchronization. Once a reason is decided the child is stopped, readers
//! are collected, and exactly one immutable outcome is produced and handed
//! to the history recorder fire-and-forget.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::deadline::TimeoutController;
use crate::dispatch::{DispatchParts, Dispatcher};
use crate::history::{OutcomeRecorder, RunMeta};
use crate::outcome::{ExecutionOutcome, ExitReason, ExitStyle, TimingSummary};
use crate::reader::{ChannelId, FORWARD_BUFFER, LineEvent, ReaderMsg, StreamSpec, spawn_reader};
use crate::request::{ConfigError, ExecutionRequest, Mode};

/// Event-loop tick; deadline checks never lag by more than this.
const TICK: Duration = Duration::from_millis(50);

/// Presentation and shutdown knobs, outside the frozen request.
pub struct RunOptions {
    pub exit_style: ExitStyle,
    /// Echo monitored lines as they arrive.
    pub echo: bool,
    /// Prefix echoed lines with their channel label.
    pub label: bool,
    /// How long to wait between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Install a Ctrl-C handler that cancels the run cleanly.
    pub handle_interrupt: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            exit_style: ExitStyle::Standard,
            echo: true,
            label: false,
            grace: Duration::from_secs(2),
            handle_interrupt: false,
        }
    }
}

type Source = (ChannelId, Box<dyn std::io::Read + Send>);

pub struct ProcessOrchestrator {
    request: ExecutionRequest,
    options: RunOptions,
    recorder: Box<dyn OutcomeRecorder>,
}

impl ProcessOrchestrator {
    pub fn new(
        request: ExecutionRequest,
        options: RunOptions,
        recorder: Box<dyn OutcomeRecorder>,
    ) -> Self {
        Self {
            request,
            options,
            recorder,
        }
    }

    /// Run to completion. Configuration problems surface as errors before
    /// anything is spawned; everything else, spawn failures included,
    /// resolves into an [`ExecutionOutcome`].
    pub fn run(self) -> Result<ExecutionOutcome, ConfigError> {
        let specs = self.request.freeze()?;
        #[cfg(not(unix))]
        if !self.request.extra_fds.is_empty() {
            return Err(ConfigError::ExtraFdsUnsupported);
        }

        let patterns: BTreeMap<String, String> = specs
            .iter()
            .map(|s| (s.label.clone(), s.matcher.pattern_str().to_string()))
            .collect();
        let meta = RunMeta::new(self.command_line(), self.request.pattern.clone());

        let started = Instant::now();
        let (child, sources) = match self.attach(&specs) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "spawn failed");
                let outcome = self.finish_outcome(
                    ExitReason::SpawnError,
                    None,
                    Dispatcher::new(&specs).into_parts(),
                    patterns,
                    started,
                    Some(e.to_string()),
                );
                self.record(&outcome, &meta);
                return Ok(outcome);
            }
        };

        let (tx, rx) = mpsc::sync_channel::<ReaderMsg>(FORWARD_BUFFER);

        if self.options.handle_interrupt {
            let cancel_tx = tx.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                let _ = cancel_tx.try_send(ReaderMsg::Cancelled);
            }) {
                debug!("interrupt handler not installed: {e}");
            }
        }

        let mut joins = Vec::new();
        for (id, source) in sources {
            joins.push(spawn_reader(id, source, started, tx.clone()));
        }
        drop(tx);

        let mut controller = TimeoutController::new(self.request.deadlines.clone(), started);
        let mut dispatcher = Dispatcher::new(&specs);
        let mut open = joins.len();

        let reason = loop {
            if let Some(r) = controller.poll(Instant::now()) {
                break r;
            }
            let wait = controller
                .next_wakeup(Instant::now())
                .map_or(TICK, |d| d.min(TICK));
            match rx.recv_timeout(wait) {
                Ok(ReaderMsg::Line(line)) => {
                    let now = Instant::now();
                    let dispatched = dispatcher.on_line(line);
                    self.echo_line(&dispatched.event);
                    // The line rearms idle (and, post-match, counts against
                    // the capture budget) before the match signal opens the
                    // capture window, so the matching line itself is free.
                    if let Some(r) = controller.on_line(now) {
                        break r;
                    }
                    if dispatched.first_match {
                        if let Some(r) = controller.on_match(now) {
                            break r;
                        }
                    }
                }
                Ok(ReaderMsg::Eof { channel, error }) => {
                    if let Some(e) = error {
                        warn!(%channel, error = %e, "read failed, marking channel EOF");
                    }
                    open = open.saturating_sub(1);
                    if open == 0 {
                        if let Some(r) = controller.on_all_eof() {
                            break r;
                        }
                    }
                }
                Ok(ReaderMsg::Cancelled) => {
                    info!("interrupted, shutting down");
                    if let Some(r) = controller.cancel() {
                        break r;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some(r) = controller.on_all_eof() {
                        break r;
                    }
                }
            }
        };
        debug!(reason = reason.as_str(), "decision made");

        // Shutdown: stop the child, which closes its pipes and unblocks any
        // reader stuck in a blocking read, then collect the readers. In pipe
        // mode the stdin reader dies with the process instead, and our exit
        // breaks the upstream pipe, telling the writer to stop producing.
        let child_status = child.and_then(|mut c| terminate(&mut c, self.options.grace));
        drop(rx);
        if !matches!(self.request.mode, Mode::Pipe) {
            for join in joins {
                let _ = join.join();
            }
        }

        let outcome = self.finish_outcome(
            reason,
            child_status,
            dispatcher.into_parts(),
            patterns,
            started,
            None,
        );
        self.record(&outcome, &meta);
        Ok(outcome)
    }

    fn command_line(&self) -> String {
        match &self.request.mode {
            Mode::Command { program, args } => {
                let mut line = program.clone();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
            Mode::Pipe => "-".to_string(),
        }
    }

    /// Start the subject and collect one readable source per channel.
    fn attach(&self, specs: &[StreamSpec]) -> std::io::Result<(Option<Child>, Vec<Source>)> {
        match &self.request.mode {
            Mode::Pipe => Ok((
                None,
                vec![(ChannelId::Stdin, Box::new(std::io::stdin()) as _)],
            )),
            Mode::Command { program, args } => {
                let monitor_stdout = specs.iter().any(|s| s.id == ChannelId::Stdout);
                let monitor_stderr = specs.iter().any(|s| s.id == ChannelId::Stderr);

                let mut cmd = Command::new(program);
                // Own process group, so shutdown can signal the child and
                // any grandchildren still holding the pipes.
                #[cfg(unix)]
                {
                    use std::os::unix::process::CommandExt;
                    cmd.process_group(0);
                }
                cmd.args(args)
                    .stdin(Stdio::null())
                    .stdout(if monitor_stdout {
                        Stdio::piped()
                    } else {
                        Stdio::inherit()
                    })
                    .stderr(if monitor_stderr {
                        Stdio::piped()
                    } else {
                        Stdio::inherit()
                    });

                #[cfg(unix)]
                let (extra, write_ends) = wire_extra_fds(&mut cmd, &self.request.extra_fds)?;

                info!(command = %self.command_line(), channels = specs.len(), "spawning");
                let spawned = cmd.spawn();

                // The parent must drop its copies of the write ends whether
                // or not the spawn worked, or the extra channels never reach
                // EOF.
                #[cfg(unix)]
                for fd in write_ends {
                    unsafe {
                        libc::close(fd);
                    }
                }

                let mut child = spawned?;
                let mut sources: Vec<Source> = Vec::new();
                if let Some(out) = child.stdout.take() {
                    sources.push((ChannelId::Stdout, Box::new(out)));
                }
                if let Some(err) = child.stderr.take() {
                    sources.push((ChannelId::Stderr, Box::new(err)));
                }
                #[cfg(unix)]
                for (id, file) in extra {
                    sources.push((id, Box::new(file)));
                }
                Ok((Some(child), sources))
            }
        }
    }

    fn echo_line(&self, event: &LineEvent) {
        if !self.options.echo {
            return;
        }
        let text = if self.options.label {
            format!("[{}] {}", event.channel, event.content)
        } else {
            event.content.clone()
        };
        match event.channel {
            ChannelId::Stderr => {
                let _ = writeln!(std::io::stderr(), "{text}");
            }
            _ => {
                let _ = writeln!(std::io::stdout(), "{text}");
            }
        }
    }

    fn finish_outcome(
        &self,
        reason: ExitReason,
        child_status: Option<i32>,
        parts: DispatchParts,
        patterns: BTreeMap<String, String>,
        started: Instant,
        error: Option<String>,
    ) -> ExecutionOutcome {
        let timing = TimingSummary {
            first_output_ms: parts.first_output_ms,
            first_match_ms: parts.first_match_ms,
            total_ms: started.elapsed().as_millis() as u64,
        };
        let raw_count = parts.matches.len() as u64;
        let match_count = self
            .request
            .options
            .max_count
            .map_or(raw_count, |cap| raw_count.min(cap));

        ExecutionOutcome {
            reason,
            exit_code: self.options.exit_style.code_for(reason),
            child_status,
            patterns,
            matched: parts.matched,
            matches: parts.matches,
            match_count,
            capture: parts.capture,
            channels: parts
                .stats
                .into_iter()
                .map(|(id, s)| (id.label(), s))
                .collect(),
            timing,
            error,
        }
    }

    fn record(&self, outcome: &ExecutionOutcome, meta: &RunMeta) {
        // History is advisory: the exit code is already fixed, so any
        // failure here is logged and dropped.
        if let Err(e) = self.recorder.record(outcome, meta) {
            debug!("run not recorded to history: {e:#}");
        }
    }
}

/// Stop a child: TERM, bounded grace, then KILL. Returns its exit code when
/// it had one (signal deaths have none).
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        // The leader already exited, but grandchildren it left behind may
        // still hold the pipes, keeping readers blocked. Sweep the group.
        unsafe {
            libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
        }
        return status.code();
    }
    debug!(pid = child.id(), "sending SIGTERM to process group");
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    let mut status = None;
    while Instant::now() < deadline {
        if let Ok(Some(s)) = child.try_wait() {
            status = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }
    // Force-kill the whole group: either the leader outlived the grace
    // period, or it exited but grandchildren may still hold the pipes.
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
    if status.is_none() {
        debug!(pid = child.id(), "grace period expired, killed");
        status = child.wait().ok();
    }
    status.and_then(|s| s.code())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }
    let _ = child.kill();
    child.wait().ok().and_then(|s| s.code())
}

/// Create one pipe per extra descriptor and dup the write end onto the
/// requested fd number in the child. Returns the parent-side read ends and
/// the write ends the parent must close after spawning.
#[cfg(unix)]
#[allow(clippy::type_complexity)]
fn wire_extra_fds(
    cmd: &mut Command,
    fds: &[u32],
) -> std::io::Result<(Vec<(ChannelId, std::fs::File)>, Vec<libc::c_int>)> {
    use std::os::fd::FromRawFd;
    use std::os::unix::process::CommandExt;

    let mut parent_ends = Vec::new();
    let mut write_ends = Vec::new();
    let mut child_ends: Vec<(libc::c_int, libc::c_int)> = Vec::new();
    for &fd in fds {
        let mut pair = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(pair.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_end, write_end) = (pair[0], pair[1]);
        parent_ends.push((ChannelId::Fd(fd), unsafe {
            std::fs::File::from_raw_fd(read_end)
        }));
        write_ends.push(write_end);
        child_ends.push((fd as libc::c_int, write_end));
    }

    if !child_ends.is_empty() {
        let base = child_ends.iter().map(|&(t, _)| t).max().unwrap_or(2) + 1;
        unsafe {
            cmd.pre_exec(move || {
                // Move every write end above the target range first, so a
                // dup2 onto one target cannot clobber another pipe's write
                // end that happens to sit on that number.
                for entry in child_ends.iter_mut() {
                    if entry.1 < base {
                        let moved = libc::fcntl(entry.1, libc::F_DUPFD, base);
                        if moved < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        libc::close(entry.1);
                        entry.1 = moved;
                    }
                }
                for &(target, write_end) in &child_ends {
                    if libc::dup2(write_end, target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(write_end);
                }
                Ok(())
            });
        }
    }
    Ok((parent_ends, write_ends))
}
