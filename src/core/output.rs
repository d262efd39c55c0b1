//! Output rendering helpers for CLI surfaces.
//!
//! `--format json` prints the command envelope; text output stays bounded and
//! readable.

use crate::core::error::QuireError;
use crate::core::record::Record;
use crate::core::time;
use colored::{ColoredString, Colorize};
use serde_json::Value as JsonValue;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

pub fn status_word(status: &str) -> ColoredString {
    let label = status.to_uppercase();
    match status {
        "ok" | "completed" => label.green().bold(),
        "awaiting_confirmation" | "processing" | "running" | "planning" => label.yellow().bold(),
        "error" | "failed" | "denied" => label.red().bold(),
        _ => label.normal(),
    }
}

/// One terminal line per record: id, version, then the document.
pub fn record_line(record: &Record) -> String {
    let tombstone = if record.is_deleted() { " (deleted)" } else { "" };
    format!(
        "{} v{}{} {}",
        record.id.dimmed(),
        record.version,
        tombstone,
        compact_line(&record.data.to_string(), 100)
    )
}

/// Print `payload` inside the command envelope for `json`, otherwise run the
/// text renderer.
pub fn emit(
    format: &str,
    cmd: &str,
    status: &str,
    payload: JsonValue,
    text: impl FnOnce(),
) -> Result<(), QuireError> {
    if format == "json" {
        let envelope = time::command_envelope(cmd, status, payload);
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        text();
    }
    Ok(())
}
