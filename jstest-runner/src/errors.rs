// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by jstest-runner.

use camino::Utf8PathBuf;
use std::{error::Error, fmt, time::Duration};
use thiserror::Error;

/// An error that occurred while loading the test manifest.
///
/// All variants are fatal: a run never starts from a manifest that failed to
/// load.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestLoadError {
    /// The manifest file could not be read.
    #[error("failed to read manifest at `{path}`")]
    Read {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: csv::Error,
    },

    /// A row failed structural parsing.
    #[error("failed to parse manifest row in `{path}`")]
    Row {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: csv::Error,
    },

    /// A required column was absent from the header row.
    #[error("manifest `{path}` is missing required column `{column}`")]
    MissingColumn {
        /// The manifest path.
        path: Utf8PathBuf,
        /// The missing column name.
        column: &'static str,
    },

    /// A row declared a test but carried no expected outcome.
    #[error("manifest row for `{test_name}` has no expected outcome")]
    MissingOutcome {
        /// The declared test name.
        test_name: String,
    },

    /// An expected-outcome value was not part of the known vocabulary.
    #[error(
        "unrecognized expected outcome `{value}` for test `{test_name}` (known values: {})",
        crate::manifest::ExpectedOutcome::variants().join(", "),
    )]
    UnrecognizedOutcome {
        /// The declared test name.
        test_name: String,
        /// The offending value.
        value: String,
    },
}

/// Error returned while compiling a test-name include filter.
#[derive(Debug, Error)]
#[error("invalid test name filter `{pattern}`")]
pub struct FilterParseError {
    pattern: String,
    #[source]
    error: regex::Error,
}

impl FilterParseError {
    pub(crate) fn new(pattern: impl Into<String>, error: regex::Error) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }
}

/// An error that occurred while parsing a server connection string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionStringError {
    /// The input was empty or whitespace-only.
    #[error("connection string is empty")]
    Empty,

    /// The input carried a scheme other than `mongodb`.
    #[error("unsupported connection scheme `{scheme}`")]
    UnsupportedScheme {
        /// The scheme that was found.
        scheme: String,
    },

    /// The authority section had no host.
    #[error("connection string has no host")]
    MissingHost,

    /// The port was present but not a valid number.
    #[error("invalid port `{value}` in connection string")]
    InvalidPort {
        /// The port text.
        value: String,
        /// The underlying error.
        #[source]
        error: std::num::ParseIntError,
    },

    /// A query-string option had no key or no `key=value` shape.
    #[error("malformed connection option `{option}`")]
    MalformedOption {
        /// The option text.
        option: String,
    },
}

/// An error from issuing a single scripted command to the server shell.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvalError {
    /// The shell process could not be spawned.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The shell program.
        program: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The shell did not finish within the allotted time.
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout {
        /// The shell program.
        program: Utf8PathBuf,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The shell exited with a failure status.
    #[error("`{program}` exited with {}: {}", display_exit_code(.exit_code), truncate_for_display(.stderr))]
    Failed {
        /// The shell program.
        program: Utf8PathBuf,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

/// Database cleanup failed after exhausting its retry budget.
///
/// Callers must treat this as fatal for the current test attempt: the test
/// body must not run against unknown server state.
#[derive(Debug, Error)]
#[error("database cleanup failed after {attempts} attempts")]
pub struct CleanupError {
    /// How many times the drop command was issued.
    pub attempts: u32,
    /// The error from the final attempt.
    #[source]
    pub last: EvalError,
}

/// Post-cleanup verification found state that should have been dropped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyCleanError {
    /// The verification command itself failed.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Collections survived the drop.
    #[error("leftover non-system collections after cleanup: {}", .leftovers.join(", "))]
    Leftovers {
        /// `db.collection` names still present.
        leftovers: Vec<String>,
    },
}

/// An error that occurred while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// The internal tokio runtime could not be created.
    #[error("error creating tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The invoking process's working directory could not be determined.
    #[error("error resolving current directory")]
    CurrentDir(#[source] std::io::Error),
}

/// An error that occurred while writing reporter output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteEventError {
    /// An error occurred while writing to the console stream.
    #[error("error writing to output")]
    Io(#[source] std::io::Error),

    /// An error occurred while writing a per-test log file.
    #[error("error writing log file `{file}`")]
    Fs {
        /// The file being written.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// Displays an error along with its source chain, one `caused by` line per
/// source.
pub struct DisplayErrorChain<'a>(&'a (dyn Error + 'static));

impl<'a> DisplayErrorChain<'a> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: &'a (dyn Error + 'static)) -> Self {
        Self(error)
    }
}

impl fmt::Display for DisplayErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self.0.source();
        while let Some(error) = cause {
            write!(f, "\n  caused by: {error}")?;
            cause = error.source();
        }
        Ok(())
    }
}

fn display_exit_code(exit_code: &Option<i32>) -> String {
    match *exit_code {
        Some(code) => format!("exit code {code}"),
        None => "an unknown status (terminated by signal?)".to_owned(),
    }
}

fn truncate_for_display(s: &str) -> String {
    const MAX: usize = 200;
    let s = s.trim();
    if s.len() <= MAX {
        s.to_owned()
    } else {
        let mut end = MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_includes_sources() {
        let inner = std::io::Error::other("pipe closed");
        let outer = EvalError::Spawn {
            program: "mongo".into(),
            error: inner,
        };
        let display = DisplayErrorChain::new(&outer).to_string();
        assert!(display.contains("failed to spawn `mongo`"), "{display}");
        assert!(display.contains("caused by: pipe closed"), "{display}");
    }

    #[test]
    fn failed_eval_truncates_long_stderr() {
        let err = EvalError::Failed {
            program: "mongo".into(),
            exit_code: Some(1),
            stderr: "x".repeat(500),
        };
        let display = err.to_string();
        assert!(display.len() < 300, "stderr not truncated: {display}");
        assert!(display.ends_with("..."));
    }
}
