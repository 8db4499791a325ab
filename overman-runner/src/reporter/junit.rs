// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Code to generate JUnit XML reports from test messages.

use super::{
    Reporter,
    events::{ErrorPhase, ExecutionResult, Message, RegistrationConfig},
    protocol::ProtocolTracker,
};
use crate::{
    errors::ReporterError,
    list::{TestList, TestPath},
    output::OutputSink,
};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use quick_junit::{
    NonSuccessKind, Report, TestCase, TestCaseStatus, TestRerun, TestSuite, XmlString,
};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// A reporter that writes a JUnit XML report once the run is done.
///
/// Each test file becomes a `<testsuite>`, and each test a `<testcase>` whose classname is the
/// test's suites joined by `::`. Failed attempts that were retried are recorded as reruns, or as
/// flaky runs if the test eventually passed.
#[derive(Debug)]
pub struct JunitReporter {
    name: String,
    output: OutputSink,
    state: Option<RunState>,
    done: bool,
}

#[derive(Debug)]
struct RunState {
    start_time: DateTime<Local>,
    protocol: ProtocolTracker,
    test_suites: DebugIgnore<IndexMap<Utf8PathBuf, TestSuite>>,
    attempts: HashMap<TestPath, AttemptState>,
}

#[derive(Debug, Default)]
struct AttemptState {
    errors: Vec<(ErrorPhase, String)>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    reruns: DebugIgnore<Vec<TestRerun>>,
}

#[derive(Default)]
struct CapturedAttempt {
    errors: Vec<(ErrorPhase, String)>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CapturedAttempt {
    fn message(&self) -> Option<&'static str> {
        self.errors.first().map(|(phase, _)| phase.label())
    }

    fn description(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let traces: Vec<_> = self
            .errors
            .iter()
            .map(|(phase, trace)| format!("{}: {trace}", phase.label()))
            .collect();
        Some(traces.join("\n"))
    }

    fn failure_type(&self) -> String {
        match self.errors.first() {
            Some((phase, _)) => format!("test failure ({phase})"),
            None => "test failure".to_owned(),
        }
    }
}

impl JunitReporter {
    /// Creates a reporter writing a report with the given name to standard output.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_output(name, OutputSink::stdout())
    }

    /// Creates a reporter writing a report with the given name to the given sink.
    pub fn with_output(name: impl Into<String>, output: OutputSink) -> Self {
        Self {
            name: name.into(),
            output,
            state: None,
            done: false,
        }
    }

    fn state_mut(&mut self) -> Result<&mut RunState, ReporterError> {
        self.state.as_mut().ok_or(ReporterError::NotRegistered)
    }
}

impl AttemptState {
    /// Takes everything recorded for the current attempt, waiting for its output to be captured.
    async fn take_attempt(&mut self) -> Result<CapturedAttempt, ReporterError> {
        Ok(CapturedAttempt {
            errors: std::mem::take(&mut self.errors),
            stdout: join_capture(self.stdout.take()).await?,
            stderr: join_capture(self.stderr.take()).await?,
        })
    }
}

fn lossy(output: &[u8]) -> XmlString {
    XmlString::new(String::from_utf8_lossy(output))
}

async fn join_capture(handle: Option<JoinHandle<Vec<u8>>>) -> Result<Vec<u8>, ReporterError> {
    match handle {
        Some(handle) => handle.await.map_err(|error| ReporterError::Panicked {
            message: error.to_string(),
        }),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl Reporter for JunitReporter {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        _config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        if self.state.is_some() || self.done {
            return Err(ReporterError::AlreadyRegistered);
        }

        let mut protocol = ProtocolTracker::new();
        protocol.register(tests)?;

        // Create suites up front so they appear in registration order.
        let mut test_suites = IndexMap::new();
        for test in tests {
            test_suites
                .entry(test.file().to_path_buf())
                .or_insert_with(|| TestSuite::new(test.file().as_str()));
        }

        self.state = Some(RunState {
            start_time,
            protocol,
            test_suites: DebugIgnore(test_suites),
            attempts: HashMap::new(),
        });
        Ok(())
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        let state = self.state_mut()?;
        state.protocol.observe(test, message.kind())?;

        match message {
            Message::Start => {
                state.attempts.entry(test.clone()).or_default();
            }
            Message::Stdio { stdout, stderr } => {
                let attempt = state.attempts.entry(test.clone()).or_default();
                attempt.stdout = Some(tokio::spawn(stdout.read_to_end()));
                attempt.stderr = Some(tokio::spawn(stderr.read_to_end()));
            }
            Message::Error { phase, trace } => {
                state
                    .attempts
                    .entry(test.clone())
                    .or_default()
                    .errors
                    .push((phase, trace));
            }
            Message::Retry { .. } => {
                let attempt = state.attempts.entry(test.clone()).or_default();
                let captured = attempt.take_attempt().await?;

                let mut rerun = TestRerun::new(NonSuccessKind::Failure);
                rerun
                    .set_type(captured.failure_type())
                    .set_system_out(lossy(&captured.stdout))
                    .set_system_err(lossy(&captured.stderr));
                if let Some(message) = captured.message() {
                    rerun.set_message(message);
                }
                if let Some(description) = captured.description() {
                    rerun.set_description(description);
                }
                attempt.reruns.push(rerun);
            }
            Message::Finish {
                result, duration, ..
            } => {
                let mut attempt = state.attempts.remove(test).unwrap_or_default();
                let captured = attempt.take_attempt().await?;

                let mut status = match result {
                    ExecutionResult::Success => TestCaseStatus::success(),
                    ExecutionResult::Failure => {
                        let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                        status.set_type(captured.failure_type());
                        if let Some(message) = captured.message() {
                            status.set_message(message);
                        }
                        if let Some(description) = captured.description() {
                            status.set_description(description);
                        }
                        status
                    }
                };
                for rerun in attempt.reruns.0.drain(..) {
                    status.add_rerun(rerun);
                }

                let mut testcase = TestCase::new(test.name(), status);
                let classname = if test.suites().is_empty() {
                    test.file().to_string()
                } else {
                    test.suites().join("::")
                };
                testcase
                    .set_classname(classname)
                    .set_time(duration)
                    .set_system_out(lossy(&captured.stdout))
                    .set_system_err(lossy(&captured.stderr));

                state
                    .test_suites
                    .entry(test.file().to_path_buf())
                    .or_insert_with(|| TestSuite::new(test.file().as_str()))
                    .add_test_case(testcase);
            }
        }

        Ok(())
    }

    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError> {
        let Some(mut state) = self.state.take() else {
            return Err(ReporterError::NotRegistered);
        };
        self.done = true;

        let elapsed = (end_time - state.start_time).to_std().unwrap_or_default();
        let mut report = Report::new(self.name.as_str());
        report
            .set_timestamp(state.start_time.fixed_offset())
            .set_time(elapsed)
            .add_test_suites(state.test_suites.drain(..).map(|(_, suite)| suite));

        let mut buf = Vec::new();
        report.serialize(&mut buf).map_err(ReporterError::Junit)?;
        debug!(bytes = buf.len(), "writing JUnit report");

        self.output.write_all(&buf).await?;
        self.output.shutdown().await?;
        Ok(())
    }
}
