//! Diagnostics rendering (§4.6): a human-readable report about the remote
//! daemon, assembled on the failure path. Must never fail to produce
//! *something*: a broken log file or registry read degrades to a
//! placeholder string rather than propagating an error.

use std::fs;
use std::path::Path;

use crate::daemon::{DaemonId, DaemonInfo, DaemonParameters};
use crate::registry::DaemonRegistry;

const LOG_TAIL_LINES: usize = 50;

/// A rendered diagnostic report, attached to `ConnectError`/`StaleAddress`
/// so the user sees why the connection to a daemon failed.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub daemon_id: DaemonId,
    pub pid: u32,
    pub log_tail: String,
    pub registry_entry: String,
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "daemon {} (pid {})", self.daemon_id, self.pid)?;
        writeln!(f, "registry entry: {}", self.registry_entry)?;
        writeln!(f, "--- last {LOG_TAIL_LINES} lines of daemon log ---")?;
        write!(f, "{}", self.log_tail)
    }
}

/// Assemble a [`Diagnostics`] report. Pure function of filesystem + registry
/// state; never panics or returns `Err`.
pub fn render(
    daemon: &DaemonInfo,
    params: &DaemonParameters,
    registry: &dyn DaemonRegistry,
) -> Diagnostics {
    let log_tail = tail_log_file(&params.log_dir, daemon.id)
        .unwrap_or_else(|| "<daemon log unavailable>".to_string());

    let registry_entry = registry
        .list()
        .ok()
        .and_then(|entries| entries.into_iter().find(|d| d.id == daemon.id))
        .map(|d| format!("{} @ {} ({:?})", d.id, d.address, d.state))
        .unwrap_or_else(|| "<no registry entry found>".to_string());

    Diagnostics {
        daemon_id: daemon.id,
        pid: daemon.pid,
        log_tail,
        registry_entry,
    }
}

fn tail_log_file(log_dir: &Path, id: DaemonId) -> Option<String> {
    let path = log_dir.join(format!("{id}.log"));
    let contents = fs::read_to_string(path).ok()?;
    let tail: Vec<&str> = contents
        .lines()
        .rev()
        .take(LOG_TAIL_LINES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(tail.join("\n"))
}

/// Renders a command line the way it appears in diagnostic output: each
/// argument quoted with a literal `"`, no escaping of embedded quotes.
pub fn format_command_line(program: &str, args: &[String]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push_str(&format!(" \"{arg}\""));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_line_quotes_each_argument() {
        let rendered = format_command_line("mvnd", &["clean".to_string(), "install".to_string()]);
        assert_eq!(rendered, "mvnd \"clean\" \"install\"");
    }

    #[test]
    fn format_command_line_does_not_escape_embedded_quotes() {
        let rendered = format_command_line("mvnd", &["-Dfoo=\"bar\"".to_string()]);
        assert_eq!(rendered, "mvnd \"-Dfoo=\"bar\"\"");
    }

    #[test]
    fn missing_log_file_degrades_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let result = tail_log_file(dir.path(), DaemonId::new());
        assert!(result.is_none());
    }
}
