use std::{
    io::{self, Write},
    sync::atomic::{AtomicUsize, Ordering},
};

const BAR_WIDTH: usize = 30;
const LABEL_WIDTH: usize = 40;

/// Single-line progress bar on stderr, so piped stdout stays clean.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total: usize,
    last_percent: AtomicUsize,
    label: String,
}

impl ProgressTracker {
    pub fn new(total: usize, label: &str) -> Self {
        Self { total: total.max(1), last_percent: AtomicUsize::new(usize::MAX), label: label.to_string() }
    }

    /// Redraws when the percentage changes or the last item completes.
    pub fn set_current(&self, current: usize, description: &str) {
        let current = current.min(self.total);
        let percent = current * 100 / self.total;
        if self.last_percent.swap(percent, Ordering::Relaxed) == percent && current < self.total {
            return;
        }

        let filled = current * BAR_WIDTH / self.total;
        let bar = "█".repeat(filled) + &"░".repeat(BAR_WIDTH - filled);

        let mut stderr = io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{}: [{bar}] {current}/{} ({percent}%): {}",
            self.label,
            self.total,
            fixed_len(description, LABEL_WIDTH)
        );
        if current >= self.total {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    }
}

/// Pads or cuts `description` to `width` chars.
fn fixed_len(description: &str, width: usize) -> String {
    if description.chars().count() > width {
        let mut cut: String = description.chars().take(width.saturating_sub(2)).collect();
        cut.push_str("..");
        cut
    } else {
        format!("{description:width$}")
    }
}
