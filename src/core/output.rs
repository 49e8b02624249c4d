//! Terminal rendering for progress lines and captured process output.

use colored::Colorize;

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

/// Last `max_lines` non-empty lines of a tool's output.
///
/// Compilers print the decisive diagnostic near the end, so error messages
/// carry the tail rather than the head.
pub fn tail_lines(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Progress lines on stderr; stdout is reserved for JSON envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    pub quiet: bool,
}

impl Reporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn step(&self, phase: &str, message: &str) {
        if !self.quiet {
            eprintln!("{} {} {}", "▸".bright_cyan(), phase.bold(), message);
        }
    }

    pub fn ok(&self, phase: &str, message: &str) {
        if !self.quiet {
            eprintln!("{} {} {}", "✓".bright_green(), phase.bold(), message);
        }
    }

    pub fn warn(&self, phase: &str, message: &str) {
        if !self.quiet {
            eprintln!("{} {} {}", "⚠".bright_yellow(), phase.bold(), message);
        }
    }

    pub fn failed(&self, phase: &str, message: &str) {
        if !self.quiet {
            eprintln!(
                "{} {} {}",
                "✗".bright_red(),
                phase.bold(),
                compact_line(message, 400).bright_red()
            );
        }
    }
}
