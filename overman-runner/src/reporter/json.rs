// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A machine-readable reporter emitting one JSON object per line.
//!
//! This is the form messages take when they cross a process boundary. Every object has a
//! `type` field:
//!
//! * `register`: the tests, the run configuration and the start time.
//! * `start`, `stdio`, `error`, `finish`, `retry`: one per message, with a `test` field.
//! * `stdio-chunk`: a chunk of captured output, emitted in stream order. The chunk is in `text`
//!   if it is valid UTF-8, and in `bytes` otherwise.
//! * `done`: the end time.

use super::{
    Reporter,
    events::{ErrorPhase, ExecutionResult, Message, RegistrationConfig},
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
use serde::Serialize;
use tokio::task::JoinHandle;

/// A reporter writing JSON lines to its sink.
///
/// Messages are validated before they are written, so the output always describes a valid
/// sequence.
#[derive(Debug)]
pub struct JsonReporter {
    output: OutputSink,
    protocol: Option<ProtocolTracker>,
    done: bool,
    pipes: Vec<JoinHandle<Result<(), ReporterError>>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum JsonEvent<'a> {
    Register {
        tests: Vec<&'a TestPath>,
        config: &'a RegistrationConfig,
        start_time: DateTime<Local>,
    },
    Start {
        test: &'a TestPath,
    },
    Stdio {
        test: &'a TestPath,
    },
    StdioChunk {
        test: &'a TestPath,
        stream: StreamName,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<&'a [u8]>,
    },
    Error {
        test: &'a TestPath,
        phase: ErrorPhase,
        trace: &'a str,
    },
    Finish {
        test: &'a TestPath,
        result: ExecutionResult,
        duration_ms: u128,
        slow: bool,
    },
    Retry {
        test: &'a TestPath,
        attempt: usize,
    },
    Done {
        end_time: DateTime<Local>,
    },
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
enum StreamName {
    Stdout,
    Stderr,
}

impl JsonEvent<'_> {
    fn to_line(&self) -> Result<Vec<u8>, ReporterError> {
        let mut line = serde_json::to_vec(self).map_err(ReporterError::Json)?;
        line.push(b'\n');
        Ok(line)
    }
}

impl JsonReporter {
    /// Creates a reporter writing to standard output.
    pub fn new() -> Self {
        Self::with_output(OutputSink::stdout())
    }

    /// Creates a reporter writing to the given sink.
    pub fn with_output(output: OutputSink) -> Self {
        Self {
            output,
            protocol: None,
            done: false,
            pipes: Vec::new(),
        }
    }

    async fn write_event(&self, event: &JsonEvent<'_>) -> Result<(), ReporterError> {
        self.output.write_all(&event.to_line()?).await?;
        Ok(())
    }

    fn spawn_pipe(&mut self, test: TestPath, stream: StreamName, mut reader: StdioReader) {
        let output = self.output.clone();
        self.pipes.push(tokio::spawn(async move {
            while let Some(chunk) = reader.recv().await {
                let text = std::str::from_utf8(&chunk).ok();
                let event = JsonEvent::StdioChunk {
                    test: &test,
                    stream,
                    text,
                    bytes: if text.is_some() { None } else { Some(&chunk) },
                };
                output.write_all(&event.to_line()?).await?;
            }
            Ok(())
        }));
    }
}

impl Default for JsonReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        if self.protocol.is_some() || self.done {
            return Err(ReporterError::AlreadyRegistered);
        }
        let mut protocol = ProtocolTracker::new();
        protocol.register(tests)?;
        self.protocol = Some(protocol);
        self.write_event(&JsonEvent::Register {
            tests: tests.iter().collect(),
            config,
            start_time,
        })
        .await
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        self.protocol
            .as_mut()
            .ok_or(ReporterError::NotRegistered)?
            .observe(test, message.kind())?;

        let event = match message {
            Message::Start => JsonEvent::Start { test },
            Message::Stdio { stdout, stderr } => {
                // Announce the streams before any of their chunks.
                self.write_event(&JsonEvent::Stdio { test }).await?;
                self.spawn_pipe(test.clone(), StreamName::Stdout, stdout);
                self.spawn_pipe(test.clone(), StreamName::Stderr, stderr);
                return Ok(());
            }
            Message::Error { phase, ref trace } => JsonEvent::Error { test, phase, trace },
            Message::Finish {
                result,
                duration,
                slow,
            } => JsonEvent::Finish {
                test,
                result,
                duration_ms: duration.as_millis(),
                slow,
            },
            Message::Retry { attempt } => JsonEvent::Retry { test, attempt },
        };
        self.write_event(&event).await
    }

    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError> {
        if self.protocol.take().is_none() {
            return Err(ReporterError::NotRegistered);
        }
        self.done = true;
        for pipe in self.pipes.drain(..) {
            pipe.await.map_err(|error| ReporterError::Panicked {
                message: error.to_string(),
            })??;
        }
        self.write_event(&JsonEvent::Done { end_time }).await?;
        self.output.shutdown().await?;
        Ok(())
    }
}
