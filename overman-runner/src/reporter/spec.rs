// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The human-readable reporter.

use super::{
    Reporter,
    events::{ErrorPhase, ExecutionResult, Message, RegistrationConfig},
    helpers::{DisplayElapsed, Styles, indent_lines},
    protocol::ProtocolTracker,
};
use crate::{
    errors::ReporterError,
    list::{TestList, TestPath},
    output::OutputSink,
    test_output::StdioReader,
};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::{StreamExt, stream};
use owo_colors::OwoColorize;
use std::{
    collections::{HashMap, HashSet},
    io,
    pin::pin,
};
use swrite::{SWrite, swrite, swriteln};
use tokio::task::JoinHandle;
use tracing::debug;

/// A reporter that prints nested suites and tests as they finish, followed by a summary and the
/// details of every failure.
///
/// ```text
///   suite_name
///     ✓ test (123ms)
///     1) broken test
///
///   1 passing (130ms)
///   1 failing
///
///   1) suite_name broken test:
///      Uncaught error: an_error
/// ```
///
/// Test output is copied verbatim to the same destination as it arrives.
#[derive(Debug)]
pub struct SpecReporter {
    output: OutputSink,
    styles: Box<Styles>,
    state: Option<RunState>,
    done: bool,
}

#[derive(Debug, Default)]
struct RunState {
    start_time: Option<DateTime<Local>>,
    protocol: ProtocolTracker,
    printed_suites: HashSet<Vec<String>>,
    passed: usize,
    failures: Vec<FailureDetail>,
    pending_errors: HashMap<TestPath, Vec<RecordedError>>,
    pipes: HashMap<TestPath, JoinHandle<io::Result<()>>>,
}

#[derive(Debug)]
struct FailureDetail {
    test: TestPath,
    errors: Vec<RecordedError>,
}

#[derive(Debug)]
struct RecordedError {
    phase: ErrorPhase,
    trace: String,
}

impl SpecReporter {
    /// Creates a reporter writing to standard output.
    pub fn new() -> Self {
        Self::with_output(OutputSink::stdout())
    }

    /// Creates a reporter writing to the given sink.
    pub fn with_output(output: OutputSink) -> Self {
        Self {
            output,
            styles: Box::default(),
            state: None,
            done: false,
        }
    }

    /// Uses ANSI colors in the output.
    pub fn colorize(&mut self) -> &mut Self {
        self.styles.colorize();
        self
    }

    fn state_mut(&mut self) -> Result<&mut RunState, ReporterError> {
        self.state.as_mut().ok_or(ReporterError::NotRegistered)
    }

    fn write_suite_headers(&mut self, test: &TestPath, out: &mut String) {
        let styles = &self.styles;
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let suites = test.suites();
        for depth in 0..suites.len() {
            let prefix = &suites[..=depth];
            if state.printed_suites.contains(prefix) {
                continue;
            }
            state.printed_suites.insert(prefix.to_vec());

            if depth == 0 {
                out.push('\n');
            }
            swriteln!(
                out,
                "{}{}",
                indent(depth + 1),
                suites[depth].style(styles.suite)
            );
        }
    }

    /// Copies both streams of an attempt to the output, in arrival order.
    fn spawn_pipe(
        &mut self,
        test: &TestPath,
        stdout: StdioReader,
        stderr: StdioReader,
    ) -> Result<(), ReporterError> {
        let output = self.output.clone();
        let handle = tokio::spawn(async move {
            let mut chunks = pin!(stream::select(stdout.into_stream(), stderr.into_stream()));
            while let Some(chunk) = chunks.next().await {
                output.write_all(&chunk).await?;
            }
            Ok(())
        });
        self.state_mut()?.pipes.insert(test.clone(), handle);
        Ok(())
    }

    /// Waits for the attempt's output to be copied, so it lands before the status line.
    ///
    /// The runner closes both streams before sending the attempt's terminal message.
    async fn finish_pipe(&mut self, test: &TestPath) -> Result<(), ReporterError> {
        match self.state_mut()?.pipes.remove(test) {
            Some(pipe) => join_pipe(pipe).await,
            None => Ok(()),
        }
    }

    fn write_summary(&self, state: &RunState, end_time: DateTime<Local>, out: &mut String) {
        let elapsed = state
            .start_time
            .and_then(|start_time| (end_time - start_time).to_std().ok())
            .unwrap_or_default();

        out.push('\n');
        swriteln!(
            out,
            "  {} passing ({})",
            state.passed.style(self.styles.pass),
            DisplayElapsed(elapsed),
        );
        if !state.failures.is_empty() {
            swriteln!(
                out,
                "  {} failing",
                state.failures.len().style(self.styles.fail)
            );
        }

        for (index, failure) in state.failures.iter().enumerate() {
            out.push('\n');
            let title = format!("{}) {}:", index + 1, failure.test.path().join(" "));
            swriteln!(out, "  {}", title.style(self.styles.fail));

            if failure.errors.is_empty() {
                swriteln!(out, "     {}", "Test failed".style(self.styles.trace));
            }
            for error in &failure.errors {
                let text = format!("{}: {}", error.phase.label(), error.trace);
                if self.styles.is_colorized {
                    let styled = text.style(self.styles.trace).to_string();
                    indent_lines(out, &styled, "     ");
                } else {
                    indent_lines(out, &text, "     ");
                }
            }
        }
        out.push('\n');
    }
}

impl Default for SpecReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn indent(level: usize) -> String {
    "  ".repeat(level)
}

async fn join_pipe(pipe: JoinHandle<io::Result<()>>) -> Result<(), ReporterError> {
    match pipe.await {
        Ok(res) => Ok(res?),
        Err(error) => Err(ReporterError::Panicked {
            message: error.to_string(),
        }),
    }
}

#[async_trait]
impl Reporter for SpecReporter {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        _config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        if self.state.is_some() || self.done {
            return Err(ReporterError::AlreadyRegistered);
        }

        let mut state = RunState {
            start_time: Some(start_time),
            ..RunState::default()
        };
        state.protocol.register(tests)?;
        debug!(count = tests.len(), "spec reporter registered tests");
        self.state = Some(state);
        Ok(())
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        self.state_mut()?.protocol.observe(test, message.kind())?;

        let mut out = String::new();
        match message {
            Message::Start => {
                self.write_suite_headers(test, &mut out);
            }
            Message::Stdio { stdout, stderr } => {
                self.spawn_pipe(test, stdout, stderr)?;
            }
            Message::Error { phase, trace } => {
                self.state_mut()?
                    .pending_errors
                    .entry(test.clone())
                    .or_default()
                    .push(RecordedError { phase, trace });
            }
            Message::Retry { attempt } => {
                self.finish_pipe(test).await?;
                self.state_mut()?.pending_errors.remove(test);
                swriteln!(
                    out,
                    "{}{} {} (attempt {attempt})",
                    indent(test.depth() + 1),
                    "↻".style(self.styles.retry),
                    test.name(),
                );
            }
            Message::Finish {
                result,
                duration,
                slow,
            } => {
                self.finish_pipe(test).await?;
                let styles = &self.styles;
                let Some(state) = self.state.as_mut() else {
                    return Err(ReporterError::NotRegistered);
                };
                let errors = state.pending_errors.remove(test).unwrap_or_default();

                swrite!(out, "{}", indent(test.depth() + 1));
                match result {
                    ExecutionResult::Success => {
                        state.passed += 1;
                        swrite!(out, "{} {}", "✓".style(styles.pass), test.name());
                    }
                    ExecutionResult::Failure => {
                        state.failures.push(FailureDetail {
                            test: test.clone(),
                            errors,
                        });
                        let marker = format!("{})", state.failures.len());
                        swrite!(
                            out,
                            "{} {}",
                            marker.style(styles.fail),
                            test.name().style(styles.fail)
                        );
                    }
                }
                if slow {
                    let annotation = format!("({}ms)", duration.as_millis());
                    swrite!(out, " {}", annotation.style(styles.slow));
                }
                out.push('\n');
            }
        }

        if !out.is_empty() {
            self.output.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError> {
        let Some(mut state) = self.state.take() else {
            return Err(ReporterError::NotRegistered);
        };
        self.done = true;

        for (_, pipe) in state.pipes.drain() {
            join_pipe(pipe).await?;
        }

        let mut out = String::new();
        self.write_summary(&state, end_time, &mut out);
        self.output.write_all(out.as_bytes()).await?;
        self.output.flush().await?;
        self.output.shutdown().await?;
        Ok(())
    }
}
