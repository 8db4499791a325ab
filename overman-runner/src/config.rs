// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration.
//!
//! Configuration can be built in code, or parsed from TOML text with
//! [`RunConfig::from_toml_str`]. Locating and reading configuration files is up to the caller.

use crate::{
    errors::ConfigParseError,
    output::OutputSink,
    reporter::{JsonReporter, JunitReporter, Reporter, SpecReporter, events::RegistrationConfig},
    test_output::DEFAULT_STDIO_BUFFER,
};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::{cmp::Ordering, fmt, io, time::Duration};

/// Tunables for a run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct RunConfig {
    /// The maximum time a single attempt of a test may run for.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts taking at least this long are flagged as slow.
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,

    /// The number of times a failing test is retried.
    pub retries: usize,

    /// The number of tests run at the same time.
    pub test_threads: TestThreads,

    /// The number of bytes of output buffered per stream before a test waits for reporters.
    pub stdio_buffer: usize,

    /// The reporters to use.
    pub reporters: Vec<ReporterConfig>,
}

impl RunConfig {
    /// The default per-attempt timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// The default slow threshold.
    pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(1);

    /// Parses configuration from TOML text. Missing keys take their default values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigParseError> {
        toml::from_str(input).map_err(ConfigParseError::new)
    }

    /// Returns the settings reporters are told about at registration time.
    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            slow_threshold: self.slow_threshold,
            timeout: self.timeout,
            retries: self.retries,
        }
    }

    /// Builds the configured reporters. If none are configured, a spec reporter writing to
    /// standard output is returned.
    pub async fn build_reporters(&self) -> io::Result<Vec<Box<dyn Reporter>>> {
        if self.reporters.is_empty() {
            return Ok(vec![Box::new(SpecReporter::new())]);
        }

        let mut reporters = Vec::with_capacity(self.reporters.len());
        for config in &self.reporters {
            reporters.push(config.build().await?);
        }
        Ok(reporters)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            slow_threshold: Self::DEFAULT_SLOW_THRESHOLD,
            retries: 0,
            test_threads: TestThreads::NumCpus,
            stdio_buffer: DEFAULT_STDIO_BUFFER,
            reporters: Vec::new(),
        }
    }
}

/// Configuration for one reporter.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReporterConfig {
    /// A [`SpecReporter`].
    Spec {
        /// The file to write to. Standard output if unset.
        #[serde(default)]
        path: Option<Utf8PathBuf>,

        /// Whether to use colors.
        #[serde(default)]
        color: bool,
    },

    /// A [`JunitReporter`].
    Junit {
        /// The file to write to. Standard output if unset.
        #[serde(default)]
        path: Option<Utf8PathBuf>,

        /// The name of the report.
        #[serde(default = "default_report_name")]
        name: String,
    },

    /// A [`JsonReporter`].
    Json {
        /// The file to write to. Standard output if unset.
        #[serde(default)]
        path: Option<Utf8PathBuf>,
    },
}

fn default_report_name() -> String {
    "overman-run".to_owned()
}

impl ReporterConfig {
    /// Builds the reporter, opening its output file if one is configured.
    pub async fn build(&self) -> io::Result<Box<dyn Reporter>> {
        let reporter: Box<dyn Reporter> = match self {
            Self::Spec { path, color } => {
                let mut reporter = SpecReporter::with_output(sink_for(path.as_ref()).await?);
                if *color {
                    reporter.colorize();
                }
                Box::new(reporter)
            }
            Self::Junit { path, name } => Box::new(JunitReporter::with_output(
                name.clone(),
                sink_for(path.as_ref()).await?,
            )),
            Self::Json { path } => {
                Box::new(JsonReporter::with_output(sink_for(path.as_ref()).await?))
            }
        };
        Ok(reporter)
    }
}

async fn sink_for(path: Option<&Utf8PathBuf>) -> io::Result<OutputSink> {
    match path {
        Some(path) => OutputSink::create_file(path.clone()).await,
        None => Ok(OutputSink::stdout()),
    }
}

/// Type for the test-threads config key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TestThreads {
    /// Run tests with a specified number of threads.
    Count(usize),

    /// Run tests with a number of threads equal to the logical CPU count.
    #[default]
    NumCpus,
}

impl TestThreads {
    /// Gets the actual number of test threads computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(threads) => threads,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl fmt::Display for TestThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(threads) => write!(f, "{threads}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for TestThreads {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = TestThreads;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(TestThreads::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(TestThreads::Count(v as usize)),
                    Ordering::Less => Ok(TestThreads::Count(
                        (get_num_cpus() as i64 + v).max(1) as usize,
                    )),
                    Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
