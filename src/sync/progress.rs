//! Progress notifications for long passes.

use std::fmt;
use std::io::IsTerminal;
use std::num::NonZeroU64;

use indicatif::{ProgressBar, ProgressStyle};

/// What the counted objects went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dumped,
    Restored,
    Verified,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Dumped => "Dumped",
            Action::Restored => "Restored",
            Action::Verified => "Verified",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub action: Action,
    pub count: u64,
    /// Estimated total. Source objects can appear mid-run, so `count` may
    /// overshoot it, and it may be zero or negative.
    pub total: i64,
}

impl Progress {
    /// Percentage of the estimate, or `None` when the estimate is not positive.
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.count as f64 / self.total as f64 * 100.0)
    }
}

/// Receives one call per processed object.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &Progress);

    fn finish(&self) {}
}

/// Logs a line every `every` objects.
pub struct LogProgress {
    every: Option<NonZeroU64>,
}

impl LogProgress {
    pub fn new(every: Option<NonZeroU64>) -> Self {
        Self { every }
    }
}

impl ProgressReporter for LogProgress {
    fn report(&self, progress: &Progress) {
        let Some(every) = self.every else {
            return;
        };
        if progress.count % every.get() != 0 {
            return;
        }
        match progress.percent() {
            Some(pct) => tracing::info!(
                "{} {}/{} files... ({:.2}%)",
                progress.action,
                progress.count,
                progress.total,
                pct
            ),
            None => tracing::info!("{} {} files...", progress.action, progress.count),
        }
    }
}

/// Drives an interactive progress bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .expect("valid template")
            .progress_chars("=> "),
        );
        Self { bar }
    }

    #[cfg(test)]
    fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BarProgress {
    fn report(&self, progress: &Progress) {
        if progress.total > 0 {
            // Never let the estimate fall behind the position.
            self.bar
                .set_length((progress.total as u64).max(progress.count));
        }
        self.bar.set_position(progress.count);
        self.bar.set_message(progress.action.to_string());
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// A progress bar when asked for one and stdout is a TTY (not piped, not a
/// cron job); log lines every `status_every` objects otherwise.
pub fn reporter_for(
    progress_bar: bool,
    status_every: Option<NonZeroU64>,
) -> Box<dyn ProgressReporter> {
    if progress_bar && std::io::stdout().is_terminal() {
        Box::new(BarProgress::new())
    } else {
        Box::new(LogProgress::new(status_every))
    }
}
