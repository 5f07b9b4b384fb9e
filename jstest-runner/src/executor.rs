// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor for test bodies.
//!
//! Each test script is an opaque external program with its own pass/fail
//! convention: exit 0 is a pass, anything else is a failure. The executor
//! launches it through the shell with a hard wall-clock timeout and captures
//! whatever it printed. Launch failures and timeouts are *synthesized* into
//! failure statuses rather than surfaced as errors, so the classification
//! engine sees every attempt the same way.

use crate::{manifest::TestDescriptor, shell::ShellContext, stopwatch};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use std::time::Duration;
use tracing::debug;

/// Hard wall-clock bound on a single test attempt.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Exit code recorded for synthesized failures (timeout, launch error).
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// The outcome of a single attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttemptResult {
    /// The test body exited 0.
    Pass,
    /// The test body exited nonzero (or died to a signal).
    Fail,
    /// The test body outlived [`TEST_TIMEOUT`] and was killed.
    Timeout,
    /// The test body could not be launched.
    ExecFail,
    /// Pre-test cleanup failed; the body was never executed.
    CleanupFail,
}

impl AttemptResult {
    /// Returns true if the attempt counts as an observed pass.
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }

    /// Returns true if the attempt counts as an observed failure of the test
    /// body (as opposed to harness-side errors).
    pub fn is_body_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Timeout | Self::ExecFail)
    }
}

/// Information about a single execution of a test.
#[derive(Clone, Debug)]
pub struct ExecuteStatus {
    /// The current attempt. In the range `[1, max_attempts]`.
    pub attempt: usize,
    /// The exit code, if the body ran and exited normally.
    pub exit_code: Option<i32>,
    /// The result of this attempt.
    pub result: AttemptResult,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error. Leak-detector warnings are appended here.
    pub stderr: String,
    /// The time at which the attempt started.
    pub start_time: DateTime<Local>,
    /// The time the attempt took.
    pub time_taken: Duration,
}

/// Launches test bodies with the correct environment and a bounded lifetime.
#[derive(Clone, Debug)]
pub struct TestExecutor {
    shell: ShellContext,
    corpus_dir: Utf8PathBuf,
    common_setup: Utf8PathBuf,
    ssl_helper: Option<Utf8PathBuf>,
    // The invoking process's working directory, exposed to scripts; the
    // child's own working directory is the corpus parent.
    invoked_from: Utf8PathBuf,
}

impl TestExecutor {
    pub(crate) fn new(
        shell: ShellContext,
        corpus_dir: Utf8PathBuf,
        common_setup: Utf8PathBuf,
        ssl_helper: Option<Utf8PathBuf>,
        invoked_from: Utf8PathBuf,
    ) -> Self {
        Self {
            shell,
            corpus_dir,
            common_setup,
            ssl_helper,
            invoked_from,
        }
    }

    /// The directory test bodies run in: the parent of the corpus, so that
    /// relative helper-file lookups inside scripts resolve consistently no
    /// matter where the harness itself was invoked.
    pub fn working_dir(&self) -> &Utf8Path {
        self.corpus_dir.parent().unwrap_or(&self.corpus_dir)
    }

    /// Runs one attempt of the given test to completion.
    pub async fn run_attempt(&self, descriptor: &TestDescriptor, attempt: usize) -> ExecuteStatus {
        let stopwatch = stopwatch::stopwatch();

        // Helper scripts load before the body: the SSL shim (only when it
        // exists on disk), then the common setup.
        let mut files: Vec<&Utf8Path> = Vec::with_capacity(3);
        if let Some(ssl_helper) = &self.ssl_helper {
            if ssl_helper.exists() {
                files.push(ssl_helper);
            }
        }
        files.push(&self.common_setup);
        files.push(&descriptor.script_path);

        debug!(
            "attempt {attempt}: {}",
            self.shell.display_script_command(&files)
        );

        let mut cmd = self.shell.script_command(&files);
        cmd.current_dir(self.working_dir());
        for (key, value) in self.child_env(descriptor) {
            cmd.env(key, value);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                let end = stopwatch.snapshot();
                return ExecuteStatus {
                    attempt,
                    exit_code: Some(SYNTHETIC_EXIT_CODE),
                    result: AttemptResult::ExecFail,
                    stdout: String::new(),
                    stderr: format!("failed to launch {}: {error}", self.shell.program()),
                    start_time: end.start_time,
                    time_taken: end.duration,
                };
            }
        };

        // kill_on_drop is set on the command: when the timeout fires and the
        // wait future is dropped, the child is killed with it.
        match tokio::time::timeout(TEST_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let end = stopwatch.snapshot();
                let exit_code = output.status.code();
                let result = if output.status.success() {
                    AttemptResult::Pass
                } else {
                    AttemptResult::Fail
                };
                ExecuteStatus {
                    attempt,
                    exit_code,
                    result,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    start_time: end.start_time,
                    time_taken: end.duration,
                }
            }
            Ok(Err(error)) => {
                let end = stopwatch.snapshot();
                ExecuteStatus {
                    attempt,
                    exit_code: Some(SYNTHETIC_EXIT_CODE),
                    result: AttemptResult::ExecFail,
                    stdout: String::new(),
                    stderr: format!("error waiting for test process: {error}"),
                    start_time: end.start_time,
                    time_taken: end.duration,
                }
            }
            Err(_) => {
                let end = stopwatch.snapshot();
                ExecuteStatus {
                    attempt,
                    exit_code: Some(SYNTHETIC_EXIT_CODE),
                    result: AttemptResult::Timeout,
                    stdout: String::new(),
                    stderr: format!(
                        "test timed out after {} seconds",
                        TEST_TIMEOUT.as_secs()
                    ),
                    start_time: end.start_time,
                    time_taken: end.duration,
                }
            }
        }
    }

    /// Identifying environment values the opaque program uses to
    /// self-configure.
    fn child_env(&self, descriptor: &TestDescriptor) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("JS_TEST_NAME", test_stem(&descriptor.name)),
            ("TEST_ROOT_DIR", self.invoked_from.to_string()),
            ("MONGO_TEST_WORKING_DIR", self.working_dir().to_string()),
        ];
        let connection = self.shell.connection();
        if let Some(username) = connection.username() {
            env.push(("MONGO_USERNAME", username.to_owned()));
        }
        if let Some(password) = connection.password() {
            env.push(("MONGO_PASSWORD", password.to_owned()));
        }
        env
    }
}

/// The declared test name without directories or extension, e.g.
/// `basic/insert.js` -> `insert`.
fn test_stem(name: &str) -> String {
    Utf8Path::new(name)
        .file_stem()
        .unwrap_or(name)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionDescriptor;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("basic/insert.js", "insert")]
    #[test_case("insert.js", "insert")]
    #[test_case("noext", "noext")]
    #[test_case("a/b/c.test.js", "c.test")]
    fn test_stem_strips_dirs_and_extension(name: &str, expected: &str) {
        assert_eq!(test_stem(name), expected);
    }

    #[test]
    fn child_env_includes_credentials_when_present() {
        let connection =
            ConnectionDescriptor::parse("mongodb://u:p@localhost:27017").unwrap();
        let shell = ShellContext::new("/usr/bin/mongo".into(), connection);
        let executor = TestExecutor::new(
            shell,
            "/repo/jstests".into(),
            "/harness/commonsetup.js".into(),
            None,
            "/home/ci".into(),
        );
        let descriptor = TestDescriptor {
            name: "core/find.js".to_owned(),
            expected: crate::manifest::ExpectedOutcome::Pass,
            script_path: "/repo/jstests/core/find.js".into(),
        };

        let env = executor.child_env(&descriptor);
        assert!(env.contains(&("JS_TEST_NAME", "find".to_owned())));
        assert!(env.contains(&("MONGO_TEST_WORKING_DIR", "/repo".to_owned())));
        assert!(env.contains(&("TEST_ROOT_DIR", "/home/ci".to_owned())));
        assert!(env.contains(&("MONGO_USERNAME", "u".to_owned())));
        assert!(env.contains(&("MONGO_PASSWORD", "p".to_owned())));
    }

    #[test]
    fn working_dir_is_corpus_parent() {
        let connection = ConnectionDescriptor::parse("localhost").unwrap();
        let shell = ShellContext::new("/usr/bin/mongo".into(), connection);
        let executor = TestExecutor::new(
            shell,
            "/repo/jstests".into(),
            "commonsetup.js".into(),
            None,
            "/home/ci".into(),
        );
        assert_eq!(executor.working_dir(), Utf8Path::new("/repo"));
    }
}
