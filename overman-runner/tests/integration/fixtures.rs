// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Local};
use overman_runner::{
    errors::ReporterError,
    list::{TestList, TestPath},
    reporter::{
        Reporter,
        events::{ErrorPhase, ExecutionResult, Message, RegistrationConfig},
        protocol::ProtocolTracker,
    },
};
use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A message with its payload reduced to something comparable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Recorded {
    Start,
    Stdio,
    Error { phase: ErrorPhase, trace: String },
    Finish { result: ExecutionResult, slow: bool },
    Retry { attempt: usize },
}

#[derive(Debug, Default)]
struct RecordingInner {
    registered: Vec<TestPath>,
    config: Option<RegistrationConfig>,
    messages: BTreeMap<TestPath, Vec<Recorded>>,
    durations: BTreeMap<TestPath, Duration>,
    stdout: BTreeMap<TestPath, Vec<u8>>,
    stderr: BTreeMap<TestPath, Vec<u8>>,
    done_calls: usize,
    all_finished_at_done: bool,
}

/// What a [`RecordingReporter`] saw, readable after the run.
#[derive(Clone, Debug, Default)]
pub(crate) struct Recording {
    inner: Arc<Mutex<RecordingInner>>,
}

impl Recording {
    pub(crate) fn reporter(&self) -> Box<dyn Reporter> {
        Box::new(RecordingReporter {
            recording: self.clone(),
            tracker: ProtocolTracker::new(),
            pipes: Vec::new(),
        })
    }

    pub(crate) fn registered(&self) -> Vec<TestPath> {
        self.inner.lock().unwrap().registered.clone()
    }

    pub(crate) fn config(&self) -> RegistrationConfig {
        self.inner
            .lock()
            .unwrap()
            .config
            .expect("tests were registered")
    }

    pub(crate) fn messages(&self, test: &TestPath) -> Vec<Recorded> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(test)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn duration(&self, test: &TestPath) -> Duration {
        self.inner.lock().unwrap().durations[test]
    }

    /// Standard output across every attempt of `test`, in attempt order.
    pub(crate) fn stdout(&self, test: &TestPath) -> String {
        let inner = self.inner.lock().unwrap();
        let bytes = inner.stdout.get(test).map_or(&[][..], Vec::as_slice);
        String::from_utf8_lossy(bytes).into_owned()
    }

    pub(crate) fn stderr(&self, test: &TestPath) -> String {
        let inner = self.inner.lock().unwrap();
        let bytes = inner.stderr.get(test).map_or(&[][..], Vec::as_slice);
        String::from_utf8_lossy(bytes).into_owned()
    }

    /// Asserts that `done` was called exactly once, after every test finished.
    pub(crate) fn assert_done_once(&self) {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.done_calls, 1, "done called exactly once");
        assert!(
            inner.all_finished_at_done,
            "every test was finished when done was called"
        );
    }
}

struct Pipe {
    test: TestPath,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
}

/// A reporter recording every call, validating message order as it goes.
struct RecordingReporter {
    recording: Recording,
    tracker: ProtocolTracker,
    pipes: Vec<Pipe>,
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        config: &RegistrationConfig,
        _start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        self.tracker.register(tests)?;
        let mut inner = self.recording.inner.lock().unwrap();
        inner.registered = tests.iter().cloned().collect();
        inner.config = Some(*config);
        Ok(())
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        self.tracker.observe(test, message.kind())?;

        let recorded = match message {
            Message::Start => Recorded::Start,
            Message::Stdio { stdout, stderr } => {
                self.pipes.push(Pipe {
                    test: test.clone(),
                    stdout: tokio::spawn(stdout.read_to_end()),
                    stderr: tokio::spawn(stderr.read_to_end()),
                });
                Recorded::Stdio
            }
            Message::Error { phase, trace } => Recorded::Error { phase, trace },
            Message::Finish {
                result,
                duration,
                slow,
            } => {
                self.recording
                    .inner
                    .lock()
                    .unwrap()
                    .durations
                    .insert(test.clone(), duration);
                Recorded::Finish { result, slow }
            }
            Message::Retry { attempt } => Recorded::Retry { attempt },
        };

        self.recording
            .inner
            .lock()
            .unwrap()
            .messages
            .entry(test.clone())
            .or_default()
            .push(recorded);
        Ok(())
    }

    async fn done(&mut self, _end_time: DateTime<Local>) -> Result<(), ReporterError> {
        let mut outputs = Vec::new();
        for pipe in self.pipes.drain(..) {
            let stdout = pipe.stdout.await.map_err(io::Error::other)?;
            let stderr = pipe.stderr.await.map_err(io::Error::other)?;
            outputs.push((pipe.test, stdout, stderr));
        }

        let mut inner = self.recording.inner.lock().unwrap();
        for (test, stdout, stderr) in outputs {
            inner.stdout.entry(test.clone()).or_default().extend(stdout);
            inner.stderr.entry(test).or_default().extend(stderr);
        }
        inner.done_calls += 1;
        inner.all_finished_at_done = self.tracker.all_finished();
        Ok(())
    }
}

/// A reporter that fails on the first message it gets.
pub(crate) struct FailingReporter;

#[async_trait]
impl Reporter for FailingReporter {
    async fn register_tests(
        &mut self,
        _tests: &TestList,
        _config: &RegistrationConfig,
        _start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        Ok(())
    }

    async fn got_message(
        &mut self,
        _test: &TestPath,
        _message: Message,
    ) -> Result<(), ReporterError> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "reporter went away").into())
    }

    async fn done(&mut self, _end_time: DateTime<Local>) -> Result<(), ReporterError> {
        Ok(())
    }
}

pub(crate) fn finished(result: ExecutionResult, slow: bool) -> Recorded {
    Recorded::Finish { result, slow }
}

pub(crate) fn error(phase: ErrorPhase, trace: &str) -> Recorded {
    Recorded::Error {
        phase,
        trace: trace.to_owned(),
    }
}
