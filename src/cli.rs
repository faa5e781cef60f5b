//! Command-line argument parsing for the `mvnd` client binary.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Client for a build daemon: sends a build request to a running daemon
/// (spawning one if none is registered) and streams its output until the
/// build finishes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Arguments forwarded verbatim to the daemon as the build's command
    /// line (e.g. goals, profiles, system properties).
    #[arg(trailing_var_arg = true)]
    pub build_args: Vec<String>,

    /// Directory the build should run in. Defaults to the current directory.
    #[arg(long)]
    pub project_dir: Option<PathBuf>,

    /// Directory used to persist registered daemons across invocations.
    #[arg(long)]
    pub registry_dir: Option<PathBuf>,

    /// Command used to spawn a fresh daemon when none is registered.
    #[arg(long, default_value = "mvnd-daemon")]
    pub daemon_program: String,

    /// Maximum number of stale-daemon eviction-and-retry cycles.
    #[arg(long, default_value_t = crate::connector::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Write detailed logs to this file instead of a daily-rotated default.
    /// Pass "stderr" to log to stderr instead of a file.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Silence all user-facing informational output on stdout; only the
    /// daemon's own log lines and the build's exit status are printed.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr/log file.
    ///
    /// -v: debug, -vv or more: trace. By default only INFO and above are
    /// shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_args_after_program_name() {
        let args = Args::parse_from(["mvnd", "clean", "install", "-DskipTests"]);
        assert_eq!(args.build_args, vec!["clean", "install", "-DskipTests"]);
    }

    #[test]
    fn verbose_flag_can_be_repeated() {
        let args = Args::parse_from(["mvnd", "-vv"]);
        assert_eq!(args.verbose, 2);
    }
}
