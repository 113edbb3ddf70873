//! Terminal progress bar for transfers

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use sd_core::{Direction, ProgressReporter};

const TEMPLATE: &str = "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Byte-level progress bar drawn on stderr
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        // Hidden until the transfer knows its size
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl ProgressReporter for BarProgress {
    fn on_start(&self, direction: Direction, total_bytes: u64, object_count: usize) {
        self.bar.set_length(total_bytes);
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            self.bar.set_style(style.progress_chars("#>-"));
        }
        let verb = match direction {
            Direction::Upload => "Uploading",
            Direction::Download => "Downloading",
        };
        self.bar
            .set_message(format!("{verb} {object_count} object(s)"));
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn on_bytes(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn on_object_complete(&self, object_index: usize) {
        tracing::debug!(object_index, "Object transferred");
    }

    fn on_finish(&self, success: bool) {
        if success {
            self.bar.finish_and_clear();
        } else {
            self.bar.abandon();
        }
    }
}
