use clap::Parser;

use crate::outcome::ExitStyle;
use crate::request::StreamSelection;

#[derive(Parser, Debug)]
#[command(
    name = "linewatch",
    about = "Run a command and exit the moment its output matches a pattern or goes quiet",
    version
)]
pub struct Cli {
    /// Regular expression to watch for.
    pub pattern: String,

    /// Command to run and monitor, after `--`. Omit it to read stdin.
    #[arg(last = true)]
    pub command: Vec<String>,

    /// Overall timeout in seconds (fractional allowed).
    #[arg(short = 't', long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Idle timeout: maximum gap between output lines, in seconds.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<f64>,

    /// Maximum time to wait for the first line of output, in seconds.
    #[arg(long, value_name = "SECS")]
    pub first_output_timeout: Option<f64>,

    /// Keep draining output for this long after a match, in seconds.
    #[arg(long, value_name = "SECS")]
    pub capture_window: Option<f64>,

    /// Keep draining up to this many lines after a match.
    #[arg(long, value_name = "LINES")]
    pub capture_lines: Option<u64>,

    /// Monitor an extra descriptor the command writes to (>= 3). Repeatable.
    #[arg(long = "fd", value_name = "N")]
    pub fds: Vec<u32>,

    /// Per-channel pattern override, e.g. `stderr=panic` or `3=READY`.
    /// Repeatable.
    #[arg(long = "pattern-for", value_name = "CHANNEL=REGEX")]
    pub pattern_for: Vec<String>,

    /// Lines matching this are never counted as matches. Repeatable.
    #[arg(short = 'x', long = "exclude", value_name = "REGEX")]
    pub exclude: Vec<String>,

    /// Case-insensitive matching.
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// Match lines that do NOT match the pattern.
    #[arg(long)]
    pub invert: bool,

    /// Stop counting matches after this many (reporting only).
    #[arg(short = 'm', long, value_name = "N")]
    pub max_count: Option<u64>,

    /// Which standard streams to monitor.
    #[arg(long, value_enum, default_value_t)]
    pub streams: StreamSelection,

    /// Prefix echoed lines with their channel label.
    #[arg(long)]
    pub label: bool,

    /// Do not echo the command's output.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print the outcome as JSON on stdout when the run ends.
    #[arg(long)]
    pub json: bool,

    /// Exit-code convention (`timeout` mirrors GNU timeout's numbering).
    #[arg(long, value_enum, default_value_t)]
    pub exit_style: ExitStyle,

    /// Do not record this run in the local history store.
    #[arg(long)]
    pub no_history: bool,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
