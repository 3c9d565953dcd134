//! Heuristic scan for destructive command shapes.
//!
//! Deliberately warn-only: a match is logged and execution proceeds. This
//! is a tripwire for audit trails, not an enforcement gate.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static DESTRUCTIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\brm\s+(-[A-Za-z]*[rf][A-Za-z]*\s+)+(/|/\*)(\s|$|;)",
            "recursive deletion of the filesystem root",
        ),
        (
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
        (r"\bmkfs(\.\w+)?\b", "filesystem format"),
        (
            r"\bdd\b[^|;&]*\bof=/dev/(sd|hd|nvme|vd|disk)",
            "raw write to a block device",
        ),
        (
            r"\bchmod\s+(-[A-Za-z]+\s+)*777\s+/(\s|$|;)",
            "world-writable permissions on the filesystem root",
        ),
        (r">\s*/dev/(sd|hd|nvme|vd)", "redirect onto a block device"),
    ]
    .into_iter()
    .map(|(pattern, label)| {
        let regex = Regex::new(pattern).expect("built-in safety pattern must compile");
        (regex, label)
    })
    .collect()
});

/// Return the descriptions of every destructive shape the command matches.
pub fn scan(command: &str) -> Vec<&'static str> {
    DESTRUCTIVE_PATTERNS
        .iter()
        .filter(|(regex, _)| regex.is_match(command))
        .map(|(_, label)| *label)
        .collect()
}

/// Log a warning for each destructive shape found. Never blocks execution.
pub fn warn_if_destructive(command: &str) {
    for label in scan(command) {
        warn!(command, pattern = label, "potentially destructive command");
    }
}
