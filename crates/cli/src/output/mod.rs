//! Output formatting
//!
//! Human-readable output uses `console` styling; `--json` switches every
//! command to strict JSON on stdout with errors on stderr.

mod formatter;

pub use formatter::Formatter;

/// Output flags shared by all commands
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
    pub no_color: bool,
}

impl OutputConfig {
    /// Whether a progress bar may be drawn
    pub fn show_progress(&self) -> bool {
        !self.json && !self.quiet
    }
}
