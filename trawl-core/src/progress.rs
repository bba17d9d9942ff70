//! Progress reporting for long-running extraction phases.
//!
//! The controller talks to a [`ProgressReporter`]; the CLI plugs in an
//! `indicatif` bar, quiet mode and library callers a no-op.

use indicatif::{ProgressBar, ProgressStyle};

/// Trait for reporting progress of extraction phases.
pub trait ProgressReporter: Send + Sync {
    /// Begin a new task. `total` is the expected item count when known.
    fn start(&self, task: &str, total: Option<u64>);

    /// Advance the current task by `amount` items.
    fn advance(&self, amount: u64);

    /// Mark the current task as finished.
    fn finish(&self);

    /// Display an informational message.
    fn message(&self, msg: &str);
}

/// Reporter that swallows everything, for callers without a terminal.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _task: &str, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Counted tasks get a bar, uncounted ones a spinner with a running tally.
fn style_for(total: Option<u64>) -> ProgressStyle {
    let template = if total.is_some() {
        "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})"
    } else {
        "{spinner:.green} {msg} {pos} items"
    };
    ProgressStyle::with_template(template)
        .unwrap()
        .progress_chars("=> ")
}

/// Reporter backed by `indicatif` progress bars for CLI use.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::new(0),
        }
    }

    /// A reporter that never draws, for quiet mode.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, task: &str, total: Option<u64>) {
        self.bar.set_length(total.unwrap_or(0));
        self.bar.set_style(style_for(total));
        self.bar.set_message(task.to_string());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_tasks_track_position_and_length() {
        let reporter = IndicatifReporter::hidden();
        reporter.start("stories", Some(4));
        reporter.advance(3);
        assert_eq!(reporter.bar.position(), 3);
        assert_eq!(reporter.bar.length(), Some(4));
        reporter.finish();
    }

    #[test]
    fn starting_a_new_task_resets_the_count() {
        let reporter = IndicatifReporter::hidden();
        reporter.start("stories", Some(4));
        reporter.advance(4);

        reporter.start("attachments", None);
        assert_eq!(reporter.bar.position(), 0);
        reporter.advance(1);
        assert_eq!(reporter.bar.position(), 1);
        reporter.finish();
    }

    #[test]
    fn noop_reporter_ignores_every_call() {
        NoopReporter.start("anything", None);
        NoopReporter.advance(7);
        NoopReporter.message("quiet");
        NoopReporter.finish();
    }
}
