// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module sits between the executor and the reporters. It receives events from the
//! executor, checks that every test's messages arrive in order, keeps run statistics, and sends
//! every message to each reporter host.

use super::{
    RunStats,
    internal_events::{ExecutorEvent, ReporterEvent},
};
use crate::{
    errors::{DisplayErrorChain, ProtocolViolation, ReporterError, RunError},
    helpers::{panic_message, plural},
    list::{TestList, TestPath},
    output::OutputSink,
    reporter::{
        Reporter,
        events::{ErrorPhase, ExecutionResult, Message, RegistrationConfig},
        protocol::{ProtocolState, ProtocolTracker},
    },
    time::StopwatchStart,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{Instrument, debug, debug_span, error, warn};

/// Context for the dispatcher.
#[derive(Debug)]
pub(super) struct DispatcherContext {
    stopwatch: StopwatchStart,
    tracker: ProtocolTracker,
    run_stats: RunStats,
    reporters: Vec<ReporterHost>,
    internal_error_output: OutputSink,
}

impl DispatcherContext {
    pub(super) fn new(stopwatch: StopwatchStart, internal_error_output: OutputSink) -> Self {
        Self {
            run_stats: RunStats::new(stopwatch.start_time()),
            stopwatch,
            tracker: ProtocolTracker::new(),
            reporters: Vec::new(),
            internal_error_output,
        }
    }

    /// Starts a host for each reporter, and registers the tests with them.
    pub(super) fn register(
        &mut self,
        test_list: Arc<TestList>,
        config: RegistrationConfig,
        reporters: Vec<Box<dyn Reporter>>,
    ) -> Result<(), ProtocolViolation> {
        self.tracker.register(test_list.iter())?;
        self.run_stats.registered = test_list.len();

        self.reporters = reporters
            .into_iter()
            .enumerate()
            .map(|(index, reporter)| ReporterHost::spawn(index, reporter))
            .collect();

        let start_time = self.stopwatch.start_time();
        for host in &self.reporters {
            host.send(ReporterEvent::Register {
                tests: test_list.clone(),
                config,
                start_time,
            });
        }
        Ok(())
    }

    /// Processes executor events until every executor is gone.
    ///
    /// On a protocol violation, signals `abort_tx` and returns the violation.
    pub(super) async fn run(
        &mut self,
        mut resp_rx: UnboundedReceiver<ExecutorEvent>,
        abort_tx: oneshot::Sender<()>,
    ) -> Result<(), ProtocolViolation> {
        while let Some(event) = resp_rx.recv().await {
            let result = match event {
                ExecutorEvent::Message { test, message } => self.handle_message(test, message),
                ExecutorEvent::InternalFault { test, description } => {
                    self.internal_fault(&format!("{test}: {description}")).await;
                    Ok(())
                }
            };

            if let Err(violation) = result {
                error!(%violation, "aborting run");
                let _ = abort_tx.send(());
                return Err(violation);
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, test: TestPath, message: Message) -> Result<(), ProtocolViolation> {
        self.tracker.observe(&test, message.kind())?;

        match &message {
            Message::Error {
                phase: ErrorPhase::Timeout,
                ..
            } => {
                self.run_stats.timed_out += 1;
            }
            Message::Retry { .. } => {
                self.run_stats.retries += 1;
            }
            Message::Finish { result, .. } => {
                self.run_stats.finished += 1;
                match result {
                    ExecutionResult::Success => self.run_stats.passed += 1,
                    ExecutionResult::Failure => self.run_stats.failed += 1,
                }
            }
            Message::Start | Message::Stdio { .. } | Message::Error { .. } => {}
        }

        self.broadcast(test, message);
        Ok(())
    }

    fn broadcast(&self, test: TestPath, message: Message) {
        let Some((last, rest)) = self.reporters.split_last() else {
            return;
        };
        for host in rest {
            host.send(ReporterEvent::Message {
                test: test.clone(),
                message: message.fork(),
            });
        }
        last.send(ReporterEvent::Message { test, message });
    }

    /// Records a fault that isn't attributable to a test body.
    pub(super) async fn internal_fault(&mut self, description: &str) {
        self.run_stats.internal_faults += 1;
        error!(description, "internal fault");

        let line = format!("internal error: {description}\n");
        if let Err(error) = self.internal_error_output.write_all(line.as_bytes()).await {
            warn!(%error, "failed to write to internal error output");
        }
    }

    /// Finishes every registered test that did not reach a terminal state.
    ///
    /// `reasons` maps tests whose executor failed to the failure message.
    pub(super) async fn finish_unfinished(
        &mut self,
        test_list: &TestList,
        mut reasons: HashMap<TestPath, String>,
    ) -> Result<(), ProtocolViolation> {
        let mut forced = 0;
        for test in test_list {
            let state = self.tracker.state(test);
            if matches!(state, ProtocolState::Finished | ProtocolState::Unregistered) {
                continue;
            }
            forced += 1;

            let reason = match reasons.remove(test) {
                Some(message) => format!("executor panicked: {message}"),
                None => "executor ended early".to_owned(),
            };
            let description = format!("test `{test}` did not finish ({reason})");
            self.internal_fault(&description).await;

            if state == ProtocolState::Pending {
                self.handle_message(test.clone(), Message::Start)?;
            }
            self.handle_message(
                test.clone(),
                Message::Error {
                    phase: ErrorPhase::Internal,
                    trace: description,
                },
            )?;
            self.handle_message(
                test.clone(),
                Message::Finish {
                    result: ExecutionResult::Failure,
                    duration: Duration::ZERO,
                    slow: false,
                },
            )?;
        }
        if forced > 0 {
            warn!("{forced} {} did not finish", plural::tests_str(forced));
        }
        debug_assert!(self.tracker.all_finished(), "every test is finished");
        Ok(())
    }

    /// Tells every reporter that the run is done, and waits for them.
    pub(super) async fn finish(mut self) -> Result<RunStats, RunError> {
        let snapshot = self.stopwatch.snapshot();
        self.run_stats.elapsed = snapshot.duration;
        let end_time = snapshot.end_time();

        let hosts = std::mem::take(&mut self.reporters);
        for host in &hosts {
            host.send(ReporterEvent::Done { end_time });
        }

        let mut errors = Vec::new();
        for host in hosts {
            if let Err(error) = host.join().await {
                errors.push(error);
            }
        }

        if let Err(error) = self.internal_error_output.flush().await {
            warn!(%error, "failed to flush internal error output");
        }

        debug!(stats = ?self.run_stats, "run finished");
        if errors.is_empty() {
            Ok(self.run_stats)
        } else {
            Err(RunError::Reporters {
                stats: self.run_stats,
                errors,
            })
        }
    }
}

/// A task driving one reporter.
///
/// Events are queued without bound, so the dispatcher never waits for a reporter. After the
/// reporter returns an error, later events are dropped.
#[derive(Debug)]
struct ReporterHost {
    index: usize,
    tx: UnboundedSender<ReporterEvent>,
    task: JoinHandle<Result<(), ReporterError>>,
}

impl ReporterHost {
    fn spawn(index: usize, mut reporter: Box<dyn Reporter>) -> Self {
        let (tx, mut rx) = unbounded_channel();
        let task = tokio::spawn(
            async move {
                let mut result = Ok(());
                while let Some(event) = rx.recv().await {
                    if result.is_err() {
                        continue;
                    }
                    result = match event {
                        ReporterEvent::Register {
                            tests,
                            config,
                            start_time,
                        } => reporter.register_tests(&tests, &config, start_time).await,
                        ReporterEvent::Message { test, message } => {
                            reporter.got_message(&test, message).await
                        }
                        ReporterEvent::Done { end_time } => reporter.done(end_time).await,
                    };
                    if let Err(error) = &result {
                        warn!(
                            error = %DisplayErrorChain::new(error),
                            "reporter failed, dropping further events",
                        );
                    }
                }
                result
            }
            .instrument(debug_span!("reporter", index)),
        );

        Self { index, tx, task }
    }

    fn send(&self, event: ReporterEvent) {
        // If the host is gone, its failure is reported by `join`.
        let _ = self.tx.send(event);
    }

    async fn join(self) -> Result<(), ReporterError> {
        let Self { index, tx, task } = self;
        drop(tx);
        match task.await {
            Ok(result) => result,
            Err(error) => {
                let message = if error.is_panic() {
                    panic_message(&*error.into_panic())
                } else {
                    error.to_string()
                };
                warn!(index, %message, "reporter task failed");
                Err(ReporterError::Panicked { message })
            }
        }
    }
}
