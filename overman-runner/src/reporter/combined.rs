// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    Reporter,
    events::{Message, RegistrationConfig},
};
use crate::{
    errors::ReporterError,
    list::{TestList, TestPath},
};
use async_trait::async_trait;
use chrono::{DateTime, Local};

/// A reporter forwarding every call to each of its children, in order.
///
/// Output streams are forked so every child sees all of a test's output. If a child returns an
/// error, the remaining children are still called and the first error is returned.
pub struct CombinedReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl CombinedReporter {
    /// Creates a reporter forwarding to `reporters`.
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

fn first_error(results: Vec<Result<(), ReporterError>>) -> Result<(), ReporterError> {
    results.into_iter().collect()
}

#[async_trait]
impl Reporter for CombinedReporter {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        let mut results = Vec::with_capacity(self.reporters.len());
        for reporter in &mut self.reporters {
            results.push(reporter.register_tests(tests, config, start_time).await);
        }
        first_error(results)
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        let mut results = Vec::with_capacity(self.reporters.len());
        let Some((last, rest)) = self.reporters.split_last_mut() else {
            return Ok(());
        };
        for reporter in rest {
            results.push(reporter.got_message(test, message.fork()).await);
        }
        results.push(last.got_message(test, message).await);
        first_error(results)
    }

    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError> {
        let mut results = Vec::with_capacity(self.reporters.len());
        for reporter in &mut self.reporters {
            results.push(reporter.done(end_time).await);
        }
        first_error(results)
    }
}
