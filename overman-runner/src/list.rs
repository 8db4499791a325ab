// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test identities and the list of tests registered for a run.

use crate::errors::DuplicateTestError;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};

/// The identity of a single test: the file it came from, plus the names of its enclosing suites
/// followed by its own name.
///
/// Every lifecycle message is keyed by a `TestPath`. Equality, hashing and ordering are
/// structural, so a `TestPath` that went through serialization compares equal to the original.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestPath {
    file: Utf8PathBuf,
    path: Vec<String>,
}

impl TestPath {
    /// Creates a new test path.
    ///
    /// # Panics
    ///
    /// Panics if `path` is empty. Every test has at least a name.
    pub fn new<I, S>(file: impl Into<Utf8PathBuf>, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path: Vec<String> = path.into_iter().map(Into::into).collect();
        assert!(!path.is_empty(), "a test path must contain the test name");
        Self {
            file: file.into(),
            path,
        }
    }

    /// Creates a test path from a libtest-style name, where suites are separated by `::`.
    pub fn from_libtest_name(file: impl Into<Utf8PathBuf>, name: &str) -> Self {
        Self::new(file, name.split("::"))
    }

    /// The file this test was discovered in.
    pub fn file(&self) -> &Utf8Path {
        &self.file
    }

    /// The full path: suite names followed by the test name.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The names of the suites enclosing this test, outermost first.
    pub fn suites(&self) -> &[String] {
        &self.path[..self.path.len() - 1]
    }

    /// The test's own name.
    pub fn name(&self) -> &str {
        &self.path[self.path.len() - 1]
    }

    /// The nesting depth of the test, which is the number of enclosing suites.
    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }

    /// Returns the path in libtest form, e.g. `suite::nested::test`.
    pub fn libtest_name(&self) -> String {
        self.path.join("::")
    }
}

impl fmt::Display for TestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.path.join(" › "))
    }
}

/// The ordered list of tests registered for a single run.
///
/// A test can be registered at most once.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    tests: Vec<TestPath>,
    seen: HashSet<TestPath>,
}

impl TestList {
    /// Creates a new, empty test list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a test list out of an iterator of paths, failing on the first duplicate.
    pub fn from_paths(
        paths: impl IntoIterator<Item = TestPath>,
    ) -> Result<Self, DuplicateTestError> {
        let mut list = Self::new();
        for path in paths {
            list.push(path)?;
        }
        Ok(list)
    }

    /// Appends a test to the list.
    pub fn push(&mut self, test: TestPath) -> Result<(), DuplicateTestError> {
        if !self.seen.insert(test.clone()) {
            return Err(DuplicateTestError::new(test));
        }
        self.tests.push(test);
        Ok(())
    }

    /// Returns true if the test was registered.
    pub fn contains(&self, test: &TestPath) -> bool {
        self.seen.contains(test)
    }

    /// Iterates over the tests in registration order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &TestPath> + '_ {
        self.tests.iter()
    }

    /// Returns the number of registered tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if no tests are registered.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Returns the number of distinct files the tests come from.
    pub fn file_count(&self) -> usize {
        self.tests
            .iter()
            .map(|test| test.file())
            .collect::<HashSet<_>>()
            .len()
    }
}

impl<'a> IntoIterator for &'a TestList {
    type Item = &'a TestPath;
    type IntoIter = std::slice::Iter<'a, TestPath>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.iter()
    }
}
