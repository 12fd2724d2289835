use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::debug;

use linewatch::cli::Cli;
use linewatch::config::FileConfig;
use linewatch::deadline::DeadlineConfig;
use linewatch::history::{HistoryStore, NoopRecorder, OutcomeRecorder};
use linewatch::matcher::MatchOptions;
use linewatch::orchestrator::{ProcessOrchestrator, RunOptions};
use linewatch::outcome::ExecutionOutcome;
use linewatch::request::{ExecutionRequest, Mode};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "linewatch=warn",
        1 => "linewatch=info",
        2 => "linewatch=debug",
        _ => "linewatch=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let exit_style = cli.exit_style;
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            // Configuration problems: nothing was spawned, distinct code.
            eprintln!("linewatch: error: {err:#}");
            std::process::exit(exit_style.config_error_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let (file, config_path) = FileConfig::load(&cwd)?;
    if let Some(p) = &config_path {
        debug!("loaded defaults from {}", p.display());
    }

    let quiet = cli.quiet;
    let json = cli.json;
    let label = cli.label || file.label;
    let no_history = cli.no_history || file.no_history;
    let exit_style = cli.exit_style;

    let request = build_request(cli, &file)?;

    let recorder: Box<dyn OutcomeRecorder> = if no_history {
        Box::new(NoopRecorder)
    } else {
        match HistoryStore::open_default() {
            Ok(store) => Box::new(store),
            Err(e) => {
                debug!("history disabled: {e:#}");
                Box::new(NoopRecorder)
            }
        }
    };

    let options = RunOptions {
        exit_style,
        echo: !quiet,
        label,
        handle_interrupt: true,
        ..Default::default()
    };

    let outcome = ProcessOrchestrator::new(request, options, recorder).run()?;
    report(&outcome, json);
    Ok(outcome.exit_code)
}

/// Merge CLI flags over file defaults into one frozen request.
fn build_request(cli: Cli, file: &FileConfig) -> Result<ExecutionRequest> {
    let deadlines = DeadlineConfig {
        overall: parse_secs(cli.timeout.or(file.timeout), "--timeout")?,
        idle: parse_secs(cli.idle_timeout.or(file.idle_timeout), "--idle-timeout")?,
        first_output: parse_secs(
            cli.first_output_timeout.or(file.first_output_timeout),
            "--first-output-timeout",
        )?,
        capture_window: parse_secs(
            cli.capture_window.or(file.capture_window),
            "--capture-window",
        )?,
        capture_lines: cli.capture_lines.or(file.capture_lines),
    };

    let mut overrides = Vec::with_capacity(cli.pattern_for.len());
    for spec in &cli.pattern_for {
        let (channel, pattern) = spec
            .split_once('=')
            .with_context(|| format!("--pattern-for {spec:?} must look like CHANNEL=REGEX"))?;
        overrides.push((
            ExecutionRequest::parse_channel(channel)?,
            pattern.to_string(),
        ));
    }

    let mut exclusions = file.exclude.clone();
    exclusions.extend(cli.exclude);

    let mode = match cli.command.split_first() {
        Some((program, args)) => Mode::Command {
            program: program.clone(),
            args: args.to_vec(),
        },
        None => Mode::Pipe,
    };

    Ok(ExecutionRequest {
        mode,
        pattern: cli.pattern,
        overrides,
        exclusions,
        options: MatchOptions {
            ignore_case: cli.ignore_case || file.ignore_case,
            invert: cli.invert,
            max_count: cli.max_count,
        },
        streams: cli.streams,
        extra_fds: cli.fds,
        deadlines,
    })
}

fn parse_secs(value: Option<f64>, flag: &str) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(Duration::from_secs_f64(v))),
        Some(v) => bail!("{flag} must be a non-negative number of seconds, got {v}"),
    }
}

/// One reason line on stderr; the full outcome on stdout when asked.
fn report(outcome: &ExecutionOutcome, json: bool) {
    if json {
        if let Ok(rendered) = serde_json::to_string_pretty(outcome) {
            println!("{rendered}");
        }
    }

    let mut line = format!("linewatch: {}", outcome.reason.describe());
    if let Some(m) = &outcome.matched {
        line.push_str(&format!(
            " on {} at +{}ms: {}",
            m.channel, m.offset_ms, m.line
        ));
    }
    if let Some(e) = &outcome.error {
        line.push_str(&format!(": {e}"));
    }
    eprintln!("{line}");
}
