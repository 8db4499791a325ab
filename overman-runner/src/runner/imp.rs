// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::DispatcherContext, executor::ExecutorContext, internal_events::ExecutorEvent,
};
use crate::{
    config::RunConfig,
    errors::{DisplayErrorChain, RunError, TestRunnerBuildError},
    helpers::{AbortOnDrop, panic_message},
    list::{TestList, TestPath},
    output::OutputSink,
    reporter::Reporter,
    source::TestSource,
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use futures::StreamExt;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{
    mpsc::{UnboundedSender, unbounded_channel},
    oneshot,
};
use tracing::{debug, error};

/// Options for [`run`].
pub struct RunOptions {
    /// The test files to run, in order. Must not be empty.
    pub files: Vec<Utf8PathBuf>,

    /// The maximum time a single attempt of a test may run for.
    pub timeout: Duration,

    /// The reporters to send messages to. Must not be empty.
    pub reporters: Vec<Box<dyn Reporter>>,

    /// Where faults not attributable to a test are written.
    pub internal_error_output: OutputSink,

    /// How tests are listed and run.
    pub source: Arc<dyn TestSource>,

    /// The remaining tunables. Its `timeout` is ignored in favor of [`Self::timeout`].
    pub config: RunConfig,
}

impl RunOptions {
    /// Creates options with the default configuration, no reporters, and internal errors written
    /// to standard error.
    pub fn new(
        files: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
        source: Arc<dyn TestSource>,
    ) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            timeout: RunConfig::DEFAULT_TIMEOUT,
            reporters: Vec::new(),
            internal_error_output: OutputSink::stderr(),
            source,
            config: RunConfig::default(),
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("files", &self.files)
            .field("timeout", &self.timeout)
            .field("reporters", &self.reporters.len())
            .field("internal_error_output", &self.internal_error_output)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Runs the tests in `options.files`, and returns statistics about the run.
///
/// This is a convenience wrapper around [`TestRunnerBuilder`].
pub async fn run(options: RunOptions) -> Result<RunStats, RunError> {
    let RunOptions {
        files,
        timeout,
        reporters,
        internal_error_output,
        source,
        config,
    } = options;

    let mut builder = TestRunnerBuilder::new();
    builder
        .set_config(config)
        .set_timeout(timeout)
        .set_internal_error_output(internal_error_output);
    for file in files {
        builder.add_file(file);
    }
    for reporter in reporters {
        builder.add_reporter(reporter);
    }

    builder.build(source)?.execute().await
}

/// Test runner options.
#[derive(Default)]
pub struct TestRunnerBuilder {
    files: Vec<Utf8PathBuf>,
    reporters: Vec<Box<dyn Reporter>>,
    config: RunConfig,
    timeout: Option<Duration>,
    internal_error_output: Option<OutputSink>,
}

impl TestRunnerBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a test file. Files are listed in the order they are added.
    pub fn add_file(&mut self, file: impl Into<Utf8PathBuf>) -> &mut Self {
        self.files.push(file.into());
        self
    }

    /// Adds a reporter.
    pub fn add_reporter(&mut self, reporter: Box<dyn Reporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    /// Sets the run configuration.
    pub fn set_config(&mut self, config: RunConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Sets the per-attempt timeout, overriding the one in the configuration.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets where faults not attributable to a test are written. Defaults to standard error.
    pub fn set_internal_error_output(&mut self, output: OutputSink) -> &mut Self {
        self.internal_error_output = Some(output);
        self
    }

    /// Creates a new test runner.
    pub fn build(self, source: Arc<dyn TestSource>) -> Result<TestRunner, TestRunnerBuildError> {
        let Self {
            files,
            reporters,
            mut config,
            timeout,
            internal_error_output,
        } = self;

        if files.is_empty() {
            return Err(TestRunnerBuildError::NoFiles);
        }
        if reporters.is_empty() {
            return Err(TestRunnerBuildError::NoReporters);
        }
        if let Some(timeout) = timeout {
            config.timeout = timeout;
        }
        if config.timeout.is_zero() {
            return Err(TestRunnerBuildError::ZeroTimeout);
        }

        Ok(TestRunner {
            files,
            reporters,
            source,
            test_threads: config.test_threads.compute().max(1),
            config,
            internal_error_output: internal_error_output.unwrap_or_else(OutputSink::stderr),
        })
    }
}

impl fmt::Debug for TestRunnerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRunnerBuilder")
            .field("files", &self.files)
            .field("reporters", &self.reporters.len())
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
pub struct TestRunner {
    files: Vec<Utf8PathBuf>,
    reporters: Vec<Box<dyn Reporter>>,
    source: Arc<dyn TestSource>,
    config: RunConfig,
    test_threads: usize,
    internal_error_output: OutputSink,
}

impl TestRunner {
    /// Returns the number of tests that will run at the same time.
    pub fn test_threads(&self) -> usize {
        self.test_threads
    }

    /// Executes the run, returning statistics once every reporter is done.
    ///
    /// Test failures are reported, not returned: an `Err` means the run was aborted or a reporter
    /// failed.
    pub async fn execute(self) -> Result<RunStats, RunError> {
        let Self {
            files,
            reporters,
            source,
            config,
            test_threads,
            internal_error_output,
        } = self;

        let mut dispatcher_cx =
            DispatcherContext::new(crate::time::stopwatch(), internal_error_output);

        let mut test_list = TestList::new();
        for file in &files {
            match source.list_tests(file).await {
                Ok(tests) => {
                    debug!(%file, count = tests.len(), "listed tests");
                    for test in tests {
                        if let Err(error) = test_list.push(test) {
                            dispatcher_cx
                                .internal_fault(&DisplayErrorChain::new(&error).to_string())
                                .await;
                        }
                    }
                }
                Err(error) => {
                    dispatcher_cx
                        .internal_fault(&DisplayErrorChain::new(&error).to_string())
                        .await;
                }
            }
        }

        let test_list = Arc::new(test_list);
        dispatcher_cx
            .register(test_list.clone(), config.registration_config(), reporters)
            .map_err(RunError::Protocol)?;
        debug!(
            tests = test_list.len(),
            files = test_list.file_count(),
            test_threads,
            configured_threads = %config.test_threads,
            "starting run",
        );

        let executor_cx = Arc::new(ExecutorContext::new(source, &config));
        let (resp_tx, resp_rx) = unbounded_channel();
        let (abort_tx, abort_rx) = oneshot::channel();

        let (failed_executors, dispatch_result) = tokio::join!(
            run_executors(executor_cx, &test_list, test_threads, resp_tx, abort_rx),
            dispatcher_cx.run(resp_rx, abort_tx),
        );
        dispatch_result.map_err(RunError::Protocol)?;

        dispatcher_cx
            .finish_unfinished(&test_list, failed_executors.into_iter().collect())
            .await
            .map_err(RunError::Protocol)?;
        dispatcher_cx.finish().await
    }
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRunner")
            .field("files", &self.files)
            .field("config", &self.config)
            .field("test_threads", &self.test_threads)
            .finish_non_exhaustive()
    }
}

/// Runs every test with at most `test_threads` in flight, until all are done or the run is
/// aborted.
///
/// Returns the tests whose executor task failed, along with the failure message.
async fn run_executors(
    executor_cx: Arc<ExecutorContext>,
    test_list: &TestList,
    test_threads: usize,
    resp_tx: UnboundedSender<ExecutorEvent>,
    mut abort_rx: oneshot::Receiver<()>,
) -> Vec<(TestPath, String)> {
    // Tests are admitted in registration order, and complete in any order. Dropping the stream
    // aborts every task in flight.
    let mut results = futures::stream::iter(test_list.iter().cloned())
        .map(|test| {
            debug!(%test, "scheduling test");
            let task = AbortOnDrop(tokio::spawn(
                executor_cx.clone().run_test(test.clone(), resp_tx.clone()),
            ));
            async move { (test, task.await) }
        })
        .buffer_unordered(test_threads);

    let mut failed = Vec::new();
    loop {
        tokio::select! {
            next = results.next() => match next {
                Some((_, Ok(()))) => {}
                Some((test, Err(join_error))) => {
                    let message = if join_error.is_panic() {
                        panic_message(&*join_error.into_panic())
                    } else {
                        join_error.to_string()
                    };
                    error!(%test, %message, "executor task failed");
                    failed.push((test, message));
                }
                None => break,
            },
            Ok(()) = &mut abort_rx => {
                debug!("run aborted, cancelling tests in flight");
                break;
            }
        }
    }
    failed
}

/// Statistics for a test run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of tests registered with reporters.
    pub registered: usize,

    /// The number of tests that reached a terminal state.
    pub finished: usize,

    /// The number of tests that passed, possibly after retries.
    pub passed: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of attempts that timed out.
    pub timed_out: usize,

    /// The number of retries.
    pub retries: usize,

    /// The number of faults not attributable to a test.
    pub internal_faults: usize,

    /// When the run started.
    pub start_time: DateTime<Local>,

    /// How long the run took.
    pub elapsed: Duration,
}

impl RunStats {
    pub(crate) fn new(start_time: DateTime<Local>) -> Self {
        Self {
            registered: 0,
            finished: 0,
            passed: 0,
            failed: 0,
            timed_out: 0,
            retries: 0,
            internal_faults: 0,
            start_time,
            elapsed: Duration::ZERO,
        }
    }

    /// Returns true if every registered test passed and there were no internal faults.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.internal_faults == 0 && self.passed == self.registered
    }
}
