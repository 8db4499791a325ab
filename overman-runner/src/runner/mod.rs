// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`], built with a [`TestRunnerBuilder`]. For
//! the common case, [`run`] builds and executes a runner from [`RunOptions`].

mod dispatcher;
mod executor;
mod imp;
mod internal_events;

pub use imp::*;
