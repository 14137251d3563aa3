//! Spinner shown while an engine operation holds the sync gate

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::sync::Mutex;
use tether_core::{Action, ProgressSink};

/// Create a spinner for indeterminate operations
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("spinner template is valid"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// [`ProgressSink`] that renders one spinner per running operation
///
/// Failures are left to the caller's error output; the spinner is only
/// cleared.
#[derive(Default)]
pub struct SpinnerProgress {
    quiet: bool,
    current: Mutex<Option<ProgressBar>>,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never draw anything, for machine-readable output
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    fn take(&self) -> Option<ProgressBar> {
        match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl ProgressSink for SpinnerProgress {
    fn started(&self, action: Action) {
        if self.quiet {
            return;
        }
        let spinner = create_spinner(&format!("Running {action}..."));
        let previous = match self.current.lock() {
            Ok(mut guard) => guard.replace(spinner),
            Err(poisoned) => poisoned.into_inner().replace(spinner),
        };
        if let Some(previous) = previous {
            previous.finish_and_clear();
        }
    }

    fn succeeded(&self, action: Action, _message: &str) {
        if let Some(spinner) = self.take() {
            spinner.finish_and_clear();
            eprintln!("{} {action}", "✓".green());
        }
    }

    fn failed(&self, _action: Action, _message: &str) {
        if let Some(spinner) = self.take() {
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_quiet_sink_draws_nothing() {
        let sink = SpinnerProgress::quiet();
        sink.started(Action::Pull);
        assert!(sink.take().is_none());
        sink.succeeded(Action::Pull, "done");
    }

    #[test]
    fn test_spinner_cleared_after_failure() {
        let sink = SpinnerProgress::new();
        sink.started(Action::Push);
        sink.failed(Action::Push, "rejected");
        assert!(sink.take().is_none());
    }
}
