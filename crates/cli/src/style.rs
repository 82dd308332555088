//! Shared styling utilities for the CLI.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use reposcope_core::models::{ConflictState, ConflictStatus};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Per-file status label: unresolved red, resolved green, unresolvable yellow.
pub fn conflict_status(status: ConflictStatus, pending: bool) -> String {
    let style = match status {
        ConflictStatus::Unresolved => Style::new().red(),
        ConflictStatus::Resolved => Style::new().green(),
        ConflictStatus::Unresolvable => Style::new().yellow(),
    };
    if pending {
        format!("{} {}", style.apply_to(status), dim("(pending)"))
    } else {
        style.apply_to(status).to_string()
    }
}

/// Overall state indicator.
pub fn state(state: ConflictState) -> String {
    match state {
        ConflictState::Idle => format!("{} No operation in conflict", Style::new().dim().apply_to("○")),
        ConflictState::InConflict => {
            format!("{} Unresolved conflicts", Style::new().red().apply_to("●"))
        }
        ConflictState::Resolvable => format!(
            "{} All conflicts resolved, ready to continue",
            Style::new().green().apply_to("●")
        ),
    }
}

/// A steady-ticking spinner with `msg`.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.set_message(msg.into());
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    spinner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_contain_message() {
        console::set_colors_enabled(false);
        assert_eq!(success("done"), "✓ done");
        assert_eq!(error("bad"), "✗ bad");
        assert_eq!(conflict_status(ConflictStatus::Resolved, true), "resolved (pending)");
        assert!(state(ConflictState::Resolvable).contains("ready to continue"));
    }
}
