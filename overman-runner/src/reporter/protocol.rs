// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracks per-test protocol state and rejects out-of-order messages.

use super::events::MessageKind;
use crate::{errors::ProtocolViolation, list::TestPath};
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

/// Where a test is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolState {
    /// The test was never registered.
    Unregistered,

    /// The test is registered, and waiting for a `start` message.
    Pending,

    /// The test has started and not yet finished.
    Running,

    /// The test has received its terminal message.
    Finished,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// A state machine validating the message order for every registered test.
///
/// Valid transitions are `pending --start--> running`, `running --stdio/error--> running`,
/// `running --finish--> finished` and `running --retry--> pending`.
#[derive(Clone, Debug, Default)]
pub struct ProtocolTracker {
    states: HashMap<TestPath, ProtocolState>,
    unfinished: usize,
}

impl ProtocolTracker {
    /// Creates a tracker with no registered tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers tests, all in the pending state.
    ///
    /// Registering a test that is already known, or twice in the same batch, is a violation. On
    /// error, no test from the batch is registered.
    pub fn register<'a>(
        &mut self,
        tests: impl IntoIterator<Item = &'a TestPath>,
    ) -> Result<(), ProtocolViolation> {
        let tests: Vec<_> = tests.into_iter().collect();
        let mut batch = HashSet::with_capacity(tests.len());
        for &test in &tests {
            let existing = match self.states.get(test) {
                Some(state) => Some(*state),
                None if !batch.insert(test) => Some(ProtocolState::Pending),
                None => None,
            };
            if let Some(state) = existing {
                return Err(ProtocolViolation::new(
                    test.clone(),
                    MessageKind::Start,
                    state,
                ));
            }
        }

        for test in tests {
            self.states.insert(test.clone(), ProtocolState::Pending);
            self.unfinished += 1;
        }
        Ok(())
    }

    /// Records a message for a test, returning an error if it arrived out of order.
    ///
    /// On error, the state of the test is left unchanged.
    pub fn observe(
        &mut self,
        test: &TestPath,
        message: MessageKind,
    ) -> Result<ProtocolState, ProtocolViolation> {
        let Some(state) = self.states.get_mut(test) else {
            return Err(ProtocolViolation::new(
                test.clone(),
                message,
                ProtocolState::Unregistered,
            ));
        };

        let next = match (*state, message) {
            (ProtocolState::Pending, MessageKind::Start) => ProtocolState::Running,
            (ProtocolState::Running, MessageKind::Stdio | MessageKind::Error) => {
                ProtocolState::Running
            }
            (ProtocolState::Running, MessageKind::Finish) => ProtocolState::Finished,
            (ProtocolState::Running, MessageKind::Retry) => ProtocolState::Pending,
            (current, _) => {
                return Err(ProtocolViolation::new(test.clone(), message, current));
            }
        };

        if next == ProtocolState::Finished {
            self.unfinished -= 1;
        }
        *state = next;
        Ok(next)
    }

    /// Returns the current state of a test.
    pub fn state(&self, test: &TestPath) -> ProtocolState {
        self.states
            .get(test)
            .copied()
            .unwrap_or(ProtocolState::Unregistered)
    }

    /// Returns true if every registered test has finished.
    pub fn all_finished(&self) -> bool {
        self.unfinished == 0
    }

    /// Returns the registered tests that have not finished yet, in no particular order.
    pub fn unfinished(&self) -> impl Iterator<Item = (&TestPath, ProtocolState)> + '_ {
        self.states
            .iter()
            .filter(|(_, state)| **state != ProtocolState::Finished)
            .map(|(test, state)| (test, *state))
    }
}
