// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use jstest_runner::errors::{
    ConnectionStringError, FilterParseError, ManifestLoadError, TestRunnerBuildError,
    WriteEventError,
};
use std::error::Error;
use thiserror::Error;
use tracing::error;

/// Exit code for configuration and load-time failures, distinct from the
/// result-mismatch exit (1) so CI can tell "the corpus regressed" apart from
/// "the harness never ran".
pub const SETUP_ERROR_EXIT_CODE: i32 = 2;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// A failure with a well-understood cause, reported without a backtrace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpectedError {
    /// The connection string did not parse.
    #[error("invalid connection string")]
    ConnectionStringParse {
        /// The underlying error.
        #[from]
        error: ConnectionStringError,
    },

    /// The name filter did not compile.
    #[error("invalid filter pattern")]
    FilterParse {
        /// The underlying error.
        #[from]
        error: FilterParseError,
    },

    /// The manifest failed to load.
    #[error("failed to load test manifest")]
    ManifestLoad {
        /// The underlying error.
        #[from]
        error: ManifestLoadError,
    },

    /// No shell binary was configured and none was found on PATH.
    #[error("could not find a `{name}` shell on PATH; specify one with --shell")]
    ShellNotFound {
        /// The binary name that was searched for.
        name: &'static str,
    },

    /// The runner could not be constructed.
    #[error("failed to build test runner")]
    RunnerBuild {
        /// The underlying error.
        #[from]
        error: TestRunnerBuildError,
    },

    /// Reporter output could not be written.
    #[error("failed to write test output")]
    WriteEvent {
        /// The underlying error.
        #[from]
        error: WriteEventError,
    },
}

impl ExpectedError {
    /// Displays this error and its causes to stderr.
    pub fn display_to_stderr(&self) {
        error!("{self}");
        let mut source = self.source();
        while let Some(cause) = source {
            error!("caused by: {cause}");
            source = cause.source();
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        SETUP_ERROR_EXIT_CODE
    }
}
