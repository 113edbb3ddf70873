//! Output formatter for human-readable and JSON output

use console::Style;
use serde::Serialize;

use super::OutputConfig;

/// Color theme for styled output
#[derive(Debug, Clone)]
pub struct Theme {
    /// Property keys in transfer summaries - cyan
    pub key: Style,
    /// Sizes and rates - green
    pub size: Style,
    /// Dataset and file names - bold
    pub name: Style,
    pub success: Style,
    pub error: Style,
    pub warning: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            key: Style::new().cyan(),
            size: Style::new().green(),
            name: Style::new().bold(),
            success: Style::new().green(),
            error: Style::new().red(),
            warning: Style::new().yellow(),
        }
    }
}

impl Theme {
    /// Returns a theme with no styling (for no-color mode)
    pub fn plain() -> Self {
        Self {
            key: Style::new(),
            size: Style::new(),
            name: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warning: Style::new(),
        }
    }
}

/// Formatter for CLI output
///
/// When JSON mode is enabled, all output is strict JSON without colors or progress.
#[derive(Debug, Clone)]
pub struct Formatter {
    config: OutputConfig,
    theme: Theme,
}

impl Formatter {
    pub fn new(config: OutputConfig) -> Self {
        let theme = if config.no_color || config.json {
            Theme::plain()
        } else {
            Theme::default()
        };
        Self { config, theme }
    }

    pub fn is_json(&self) -> bool {
        self.config.json
    }

    pub fn style_key(&self, text: &str) -> String {
        self.theme.key.apply_to(text).to_string()
    }

    pub fn style_size(&self, text: &str) -> String {
        self.theme.size.apply_to(text).to_string()
    }

    pub fn style_name(&self, text: &str) -> String {
        self.theme.name.apply_to(text).to_string()
    }

    /// Output a success message
    pub fn success(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }

        let checkmark = self.theme.success.apply_to("✓");
        println!("{checkmark} {message}");
    }

    /// Output an error message
    ///
    /// Errors are always printed, even in quiet mode.
    pub fn error(&self, message: &str) {
        if self.config.json {
            let error = serde_json::json!({ "error": message });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error).unwrap_or_else(|_| message.to_string())
            );
        } else {
            let cross = self.theme.error.apply_to("✗");
            eprintln!("{cross} {message}");
        }
    }

    /// Output a structured error with a machine-readable kind
    pub fn error_json<T: Serialize>(&self, value: &T, message: &str) {
        if self.config.json {
            match serde_json::to_string_pretty(value) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{message}"),
            }
        } else {
            self.error(message);
        }
    }

    pub fn warning(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }

        let warn_icon = self.theme.warning.apply_to("⚠");
        eprintln!("{warn_icon} {message}");
    }

    /// Output JSON directly
    pub fn json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing output: {e}"),
        }
    }

    /// Print a line of text (respects quiet mode)
    pub fn println(&self, message: &str) {
        if self.config.quiet {
            return;
        }
        println!("{message}");
    }

    /// Print an aligned `key: value` line
    pub fn field(&self, key: &str, value: &str) {
        self.println(&format!("  {:<12} {value}", self.style_key(&format!("{key}:"))));
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatter_default() {
        let formatter = Formatter::default();
        assert!(!formatter.is_json());
    }

    #[test]
    fn test_formatter_json_mode() {
        let config = OutputConfig {
            json: true,
            ..Default::default()
        };
        let formatter = Formatter::new(config);
        assert!(formatter.is_json());
        // JSON output is never styled
        assert_eq!(formatter.style_key("size"), "size");
    }

    #[test]
    fn test_plain_theme_has_no_escapes() {
        let config = OutputConfig {
            no_color: true,
            ..Default::default()
        };
        let formatter = Formatter::new(config);
        assert_eq!(formatter.style_size("1 MiB"), "1 MiB");
        assert_eq!(formatter.style_name("data.bin"), "data.bin");
    }

    #[test]
    fn test_progress_visibility() {
        assert!(OutputConfig::default().show_progress());
        let quiet = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        assert!(!quiet.show_progress());
    }
}
