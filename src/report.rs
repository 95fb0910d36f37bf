// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Section logging and progress reporting.
//!
//! Library code talks to a [`Reporter`]; the CLI plugs in [`TerminalReporter`],
//! everything else gets the [`SilentReporter`].
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::error::LoggedError;
use crate::write;

/// A running progress indicator.
pub trait Progress: Send + Sync {
    fn inc(&self, delta: u64);
    fn set_message(&self, message: String);
    fn finish(&self);
}

/// Sink for user-facing messages.
pub trait Reporter: Send + Sync {
    /// Start of a pipeline phase.
    fn section(&self, label: &str, message: &str);
    /// Step inside the current phase.
    fn step(&self, label: &str, message: &str);
    fn warn(&self, message: &str);
    fn failure(&self, message: &str);
    fn progress(&self, total: u64, message: &str) -> Box<dyn Progress>;

    /// Print `err` in full and return it wrapped as a [`LoggedError`].
    fn fail(&self, summary: &str, err: anyhow::Error) -> anyhow::Error {
        self.failure(&format!("{}: {:#}", summary, err));
        LoggedError::new(summary, err).into()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

struct NoProgress;

impl Progress for NoProgress {
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _message: String) {}
    fn finish(&self) {}
}

impl Reporter for SilentReporter {
    fn section(&self, label: &str, message: &str) {
        tracing::debug!(label, message);
    }
    fn step(&self, label: &str, message: &str) {
        tracing::debug!(label, message);
    }
    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }
    fn failure(&self, message: &str) {
        tracing::debug!("{}", message);
    }
    fn progress(&self, _total: u64, _message: &str) -> Box<dyn Progress> {
        Box::new(NoProgress)
    }
}

/// Colored labels on stderr, with animated bars unless `plain` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalReporter {
    plain: bool,
}

impl TerminalReporter {
    pub fn new(plain: bool) -> Self {
        Self { plain }
    }
}

// Writing to stderr can only fail when stderr is gone, nothing useful to do then.
impl Reporter for TerminalReporter {
    fn section(&self, label: &str, message: &str) {
        let _ = write::ok(label, message);
    }
    fn step(&self, label: &str, message: &str) {
        let _ = write::nested(label, message);
    }
    fn warn(&self, message: &str) {
        let _ = write::warn("Warning", message);
    }
    fn failure(&self, message: &str) {
        let _ = write::error("Error", message);
    }
    fn progress(&self, total: u64, message: &str) -> Box<dyn Progress> {
        if self.plain {
            let _ = write::nested("Working", message);
            return Box::new(NoProgress);
        }
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
        if let Ok(style) =
            ProgressStyle::with_template("{spinner} {bar:30.cyan/blue} {pos:>3}/{len:3} {msg}")
        {
            bar.set_style(style);
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Box::new(Bar(bar))
    }
}

struct Bar(ProgressBar);

impl Progress for Bar {
    fn inc(&self, delta: u64) {
        self.0.inc(delta);
    }
    fn set_message(&self, message: String) {
        self.0.set_message(message);
    }
    fn finish(&self) {
        self.0.finish_and_clear();
    }
}
