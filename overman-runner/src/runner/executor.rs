// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor for tests.
//!
//! This component runs attempts through the test source and reports what happened to the
//! dispatcher. It never talks to reporters directly: all communication is mediated by the
//! dispatcher.

use super::internal_events::ExecutorEvent;
use crate::{
    config::RunConfig,
    errors::DisplayErrorChain,
    list::TestPath,
    reporter::events::{ErrorPhase, ExecutionResult, Message},
    source::{AttemptOutcome, TestAttempt, TestError, TestOverrides, TestSource},
    test_output::stdio_channel,
    time::{StopwatchStart, wait_for_deadline},
};
use debug_ignore::DebugIgnore;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument};

#[derive(Debug)]
pub(super) struct ExecutorContext {
    source: DebugIgnore<Arc<dyn TestSource>>,
    timeout: Duration,
    slow_threshold: Duration,
    retries: usize,
    stdio_buffer: usize,
}

impl ExecutorContext {
    pub(super) fn new(source: Arc<dyn TestSource>, config: &RunConfig) -> Self {
        Self {
            source: DebugIgnore(source),
            timeout: config.timeout,
            slow_threshold: config.slow_threshold,
            retries: config.retries,
            stdio_buffer: config.stdio_buffer,
        }
    }

    /// Runs a test to completion, retrying failed attempts while retries remain.
    #[instrument(level = "debug", skip_all, fields(test = %test))]
    pub(super) async fn run_test(
        self: Arc<Self>,
        test: TestPath,
        resp_tx: UnboundedSender<ExecutorEvent>,
    ) {
        let send = |message: Message| {
            // The dispatcher only goes away if the run is being aborted.
            let _ = resp_tx.send(ExecutorEvent::Message {
                test: test.clone(),
                message,
            });
        };

        let total_attempts = self.retries + 1;
        for attempt in 1..=total_attempts {
            send(Message::Start);

            let (stdout, stdout_reader) = stdio_channel(self.stdio_buffer);
            let (stderr, stderr_reader) = stdio_channel(self.stdio_buffer);
            send(Message::Stdio {
                stdout: stdout_reader,
                stderr: stderr_reader,
            });

            let overrides = TestOverrides::new();
            let stopwatch = crate::time::stopwatch();
            let outcome = self
                .run_attempt(
                    TestAttempt {
                        test: test.clone(),
                        attempt,
                        stdout: stdout.clone(),
                        stderr: stderr.clone(),
                        overrides: overrides.clone(),
                    },
                    &stopwatch,
                )
                .await;
            stdout.close();
            stderr.close();
            let snapshot = stopwatch.snapshot();

            let (result, errors) = match outcome {
                AttemptOutcome::Passed => (ExecutionResult::Success, Vec::new()),
                AttemptOutcome::Failed { errors } => (ExecutionResult::Failure, errors),
                AttemptOutcome::StartFailed(error) => {
                    let description = DisplayErrorChain::new(&error).to_string();
                    let _ = resp_tx.send(ExecutorEvent::InternalFault {
                        test: test.clone(),
                        description: description.clone(),
                    });
                    (
                        ExecutionResult::Failure,
                        vec![TestError::new(ErrorPhase::Internal, description)],
                    )
                }
            };

            for TestError { phase, trace } in errors {
                send(Message::Error { phase, trace });
            }

            if !result.is_success() && attempt < total_attempts {
                debug!(attempt, "attempt failed, retrying");
                send(Message::Retry {
                    attempt: attempt + 1,
                });
                continue;
            }

            let slow_threshold = overrides.slow_threshold().unwrap_or(self.slow_threshold);
            debug!(attempt, %result, duration = ?snapshot.duration, "test finished");
            send(Message::Finish {
                result,
                duration: snapshot.duration,
                slow: snapshot.duration >= slow_threshold,
            });
            return;
        }
    }

    /// Runs one attempt, racing it against its deadline.
    ///
    /// On timeout the attempt's future is dropped, which cancels it.
    async fn run_attempt(
        &self,
        attempt: TestAttempt,
        stopwatch: &StopwatchStart,
    ) -> AttemptOutcome {
        let deadline = wait_for_deadline(
            stopwatch.instant(),
            self.timeout,
            attempt.overrides.subscribe_timeout(),
        );

        tokio::select! {
            biased;

            outcome = self.source.run_attempt(attempt) => outcome,
            timeout = deadline => {
                debug!(?timeout, "attempt timed out");
                AttemptOutcome::failed(
                    ErrorPhase::Timeout,
                    format!("test timed out after {}ms", timeout.as_millis()),
                )
            }
        }
    }
}
