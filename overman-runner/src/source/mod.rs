// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution strategies: how tests are discovered and how a single attempt is run.
//!
//! The runner is agnostic to where tests live. A [`TestSource`] lists the tests in a file and
//! runs one attempt of a test, writing the test's output to the attempt's streams. Two sources
//! are provided:
//!
//! * [`in_process::SuiteRegistry`]: test bodies are async closures run as tokio tasks.
//! * [`process::LibtestSource`]: test files are executables speaking the libtest command-line
//!   protocol, and each attempt is a child process.

pub mod in_process;
pub mod process;

use crate::{
    errors::{ListError, StartAttemptError},
    list::TestPath,
    reporter::events::ErrorPhase,
    test_output::StdioWriter,
};
use async_trait::async_trait;
use camino::Utf8Path;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;

/// Discovers and runs tests.
///
/// Attempts may be cancelled at any await point by dropping the future returned by
/// [`run_attempt`](Self::run_attempt); implementations must release the attempt's resources
/// (tasks, child processes) when that happens.
#[async_trait]
pub trait TestSource: Send + Sync + 'static {
    /// Lists the tests in a file, in definition order.
    async fn list_tests(&self, file: &Utf8Path) -> Result<Vec<TestPath>, ListError>;

    /// Runs one attempt of a test.
    async fn run_attempt(&self, attempt: TestAttempt) -> AttemptOutcome;
}

/// Everything a source needs to run one attempt of a test.
#[derive(Debug)]
pub struct TestAttempt {
    pub(crate) test: TestPath,
    pub(crate) attempt: usize,
    pub(crate) stdout: StdioWriter,
    pub(crate) stderr: StdioWriter,
    pub(crate) overrides: TestOverrides,
}

impl TestAttempt {
    /// The test to run.
    pub fn test(&self) -> &TestPath {
        &self.test
    }

    /// The 1-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The stream for the attempt's standard output.
    pub fn stdout(&self) -> &StdioWriter {
        &self.stdout
    }

    /// The stream for the attempt's standard error.
    pub fn stderr(&self) -> &StdioWriter {
        &self.stderr
    }

    /// Per-test overrides of run settings, for the duration of this attempt.
    pub fn overrides(&self) -> &TestOverrides {
        &self.overrides
    }
}

/// The result of running one attempt of a test.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The attempt passed.
    Passed,

    /// The attempt failed. `errors` may be empty.
    Failed {
        /// The errors observed during the attempt, in order.
        errors: Vec<TestError>,
    },

    /// The attempt could not be started. This is an internal fault.
    StartFailed(StartAttemptError),
}

impl AttemptOutcome {
    /// Creates a failed outcome with a single error.
    pub fn failed(phase: ErrorPhase, trace: impl Into<String>) -> Self {
        Self::Failed {
            errors: vec![TestError::new(phase, trace)],
        }
    }
}

/// An error observed while running an attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestError {
    /// The phase the error occurred in.
    pub phase: ErrorPhase,

    /// The verbatim diagnostic.
    pub trace: String,
}

impl TestError {
    /// Creates a new error.
    pub fn new(phase: ErrorPhase, trace: impl Into<String>) -> Self {
        Self {
            phase,
            trace: trace.into(),
        }
    }
}

/// Settings a test can override for itself while an attempt runs.
///
/// Overrides last for the current attempt only, and win over run-wide settings.
#[derive(Clone, Debug)]
pub struct TestOverrides {
    inner: Arc<OverridesInner>,
}

#[derive(Debug)]
struct OverridesInner {
    slow_threshold: Mutex<Option<Duration>>,
    timeout: watch::Sender<Option<Duration>>,
}

impl TestOverrides {
    pub(crate) fn new() -> Self {
        let (timeout, _) = watch::channel(None);
        Self {
            inner: Arc::new(OverridesInner {
                slow_threshold: Mutex::new(None),
                timeout,
            }),
        }
    }

    /// Sets the slow threshold for this attempt.
    pub fn set_slow_threshold(&self, threshold: Duration) {
        *self
            .inner
            .slow_threshold
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(threshold);
    }

    /// Sets the timeout for this attempt, measured from the start of the attempt.
    ///
    /// If the new timeout has already elapsed, the attempt times out immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.timeout.send_replace(Some(timeout));
    }

    pub(crate) fn slow_threshold(&self) -> Option<Duration> {
        *self
            .inner
            .slow_threshold
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe_timeout(&self) -> watch::Receiver<Option<Duration>> {
        self.inner.timeout.subscribe()
    }
}
