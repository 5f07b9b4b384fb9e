// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`], which drives every
//! selected test through the attempt state machine: isolation cleanup, body
//! execution, classification against the manifest's expectation, and bounded
//! retries for flaky pass-expected tests. Tests run strictly one at a time --
//! cleanup is a whole-server operation, so concurrent bodies would see each
//! other's state.

use crate::{
    errors::{DisplayErrorChain, TestRunnerBuildError},
    executor::{AttemptResult, ExecuteStatus, TestExecutor},
    isolation::IsolationController,
    leak::{LeakCheckOptions, LeakDetector},
    manifest::{ExpectedOutcome, TestDescriptor, TestManifest},
    shell::ShellContext,
    stopwatch,
};
use camino::Utf8PathBuf;
use std::{convert::Infallible, time::Duration};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Attempt budget for pass-expected tests: enough to absorb flakiness without
/// masking a genuine regression.
pub const MAX_PASS_ATTEMPTS: usize = 5;

/// Pause between retry attempts. Deliberately fixed rather than exponential:
/// the corpus is large enough that backoff would dominate the run.
pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Test runner options.
#[derive(Debug)]
pub struct TestRunnerBuilder {
    drop_collections: bool,
    retries: bool,
    verify_cleanup: bool,
    leak_check: Option<LeakCheckOptions>,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            drop_collections: true,
            retries: true,
            verify_cleanup: false,
            leak_check: None,
        }
    }
}

impl TestRunnerBuilder {
    /// Sets whether user state is dropped before each attempt. On by default.
    pub fn set_drop_collections(&mut self, drop_collections: bool) -> &mut Self {
        self.drop_collections = drop_collections;
        self
    }

    /// Sets whether pass-expected tests are retried. On by default.
    pub fn set_retries(&mut self, retries: bool) -> &mut Self {
        self.retries = retries;
        self
    }

    /// Enables the post-cleanup verification query. Off by default.
    pub fn set_verify_cleanup(&mut self, verify_cleanup: bool) -> &mut Self {
        self.verify_cleanup = verify_cleanup;
        self
    }

    /// Enables the leak detector. Off by default.
    pub fn set_leak_check(&mut self, options: Option<LeakCheckOptions>) -> &mut Self {
        self.leak_check = options;
        self
    }

    /// Creates a new test runner.
    pub fn build(
        self,
        shell: ShellContext,
        corpus_dir: Utf8PathBuf,
        common_setup: Utf8PathBuf,
        ssl_helper: Option<Utf8PathBuf>,
    ) -> Result<TestRunner, TestRunnerBuildError> {
        let runtime = Runtime::new().map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let invoked_from = std::env::current_dir()
            .map_err(TestRunnerBuildError::CurrentDir)
            .and_then(|dir| {
                Utf8PathBuf::from_path_buf(dir).map_err(|dir| {
                    TestRunnerBuildError::CurrentDir(std::io::Error::other(format!(
                        "current directory {} is not valid UTF-8",
                        dir.display()
                    )))
                })
            })?;

        let isolation = IsolationController::new(shell.clone(), self.drop_collections);
        let executor = TestExecutor::new(
            shell,
            corpus_dir,
            common_setup,
            ssl_helper,
            invoked_from,
        );

        Ok(TestRunner {
            executor,
            isolation,
            leak: self.leak_check.map(LeakDetector::new),
            retries_enabled: self.retries,
            verify_cleanup: self.verify_cleanup,
            runtime,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    executor: TestExecutor,
    isolation: IsolationController,
    leak: Option<LeakDetector>,
    retries_enabled: bool,
    verify_cleanup: bool,
    runtime: Runtime,
}

impl TestRunner {
    /// Executes the selected tests, each one in its own process.
    ///
    /// The callback is called with events as the run progresses.
    pub fn execute<'m, F>(&self, manifest: &'m TestManifest, mut callback: F) -> RunStats
    where
        F: FnMut(TestEvent<'_, 'm>),
    {
        self.try_execute::<Infallible, _>(manifest, |event| {
            callback(event);
            Ok(())
        })
        .expect("Err branch is infallible")
    }

    /// Executes the selected tests, each one in its own process.
    ///
    /// Accepts a callback that is called with events as the run progresses.
    /// If the callback returns an error, the run terminates and the callback
    /// is no longer called.
    pub fn try_execute<'m, E, F>(
        &self,
        manifest: &'m TestManifest,
        mut callback: F,
    ) -> Result<RunStats, E>
    where
        F: FnMut(TestEvent<'_, 'm>) -> Result<(), E>,
    {
        let run_stopwatch = stopwatch::stopwatch();
        let mut stats = RunStats {
            initial_run_count: manifest.len(),
            ..RunStats::default()
        };

        callback(TestEvent::RunStarted {
            test_count: manifest.len(),
        })?;

        for descriptor in manifest.iter() {
            callback(TestEvent::TestStarted { descriptor })?;
            let record = self
                .runtime
                .block_on(self.run_test_instance(descriptor, &mut callback))?;
            stats.on_test_finished(&record);
            callback(TestEvent::TestFinished {
                record: &record,
                current_stats: &stats,
            })?;
        }

        let elapsed = run_stopwatch.snapshot().duration;
        callback(TestEvent::RunFinished {
            stats: &stats,
            elapsed,
        })?;

        Ok(stats)
    }

    // ---
    // Helper methods
    // ---

    /// Runs all attempts of a single test, producing its terminal record.
    async fn run_test_instance<'m, E, F>(
        &self,
        descriptor: &'m TestDescriptor,
        callback: &mut F,
    ) -> Result<TestRecord<'m>, E>
    where
        F: FnMut(TestEvent<'_, 'm>) -> Result<(), E>,
    {
        // Skips never launch a process.
        if descriptor.expected == ExpectedOutcome::Skip {
            return Ok(TestRecord {
                descriptor,
                kind: RecordKind::Skipped,
                final_result: FinalResult::Skipped,
                matches_expectation: true,
            });
        }

        // A missing script is terminal before any attempt: it is never
        // treated as the expected failure, even for fail-expected tests.
        if !descriptor.script_path.exists() {
            debug!(test_name = %descriptor.name, "script file not found");
            return Ok(TestRecord {
                descriptor,
                kind: RecordKind::FileMissing,
                final_result: FinalResult::Errored,
                matches_expectation: false,
            });
        }

        let max_attempts = self.max_attempts(descriptor.expected);
        let mut statuses = Vec::new();

        let last_matched = loop {
            let attempt = statuses.len() + 1;
            let status = self.run_attempt(descriptor, attempt).await;
            let matched = matches_expectation(descriptor.expected, status.result);

            if matched {
                // A match ends the loop immediately, even on a late attempt:
                // a test that ultimately passes is a pass, not a retried
                // failure.
                statuses.push(status);
                break true;
            } else if attempt < max_attempts {
                callback(TestEvent::AttemptFailedWillRetry {
                    descriptor,
                    status: &status,
                    delay: RETRY_PAUSE,
                })?;
                statuses.push(status);
                tokio::time::sleep(RETRY_PAUSE).await;
            } else {
                statuses.push(status);
                break false;
            }
        };

        let statuses = ExecutionStatuses::new(statuses);
        let final_result = final_result_of(statuses.last_status().result);
        Ok(TestRecord {
            descriptor,
            kind: RecordKind::Executed(statuses),
            final_result,
            matches_expectation: last_matched,
        })
    }

    /// Runs one attempt: cleanup, announce, body, leak probe.
    async fn run_attempt(&self, descriptor: &TestDescriptor, attempt: usize) -> ExecuteStatus {
        let stopwatch = stopwatch::stopwatch();

        // Cleanup must succeed before the body runs; a test executed against
        // unknown state proves nothing either way.
        if let Err(error) = self.isolation.drop_all_user_state().await {
            let end = stopwatch.snapshot();
            return ExecuteStatus {
                attempt,
                exit_code: None,
                result: AttemptResult::CleanupFail,
                stdout: String::new(),
                stderr: format!(
                    "pre-test cleanup failed; test body was not executed\n{}",
                    DisplayErrorChain::new(&error)
                ),
                start_time: end.start_time,
                time_taken: end.duration,
            };
        }

        if self.verify_cleanup {
            if let Err(error) = self.isolation.verify_clean().await {
                warn!(
                    test_name = %descriptor.name,
                    "cleanup verification failed: {error}"
                );
            }
        }

        self.isolation.announce(&descriptor.name).await;

        let mut status = self.executor.run_attempt(descriptor, attempt).await;

        if let Some(detector) = &self.leak {
            let leaked = detector.idle_transactions().await;
            if !leaked.is_empty() {
                warn!(
                    test_name = %descriptor.name,
                    "{} leaked session(s) after attempt {attempt}",
                    leaked.len()
                );
                status.stderr.push_str(&LeakDetector::format_warning(&leaked));
            }
        }

        status
    }

    fn max_attempts(&self, expected: ExpectedOutcome) -> usize {
        match expected {
            // Retrying a fail-expected test would hide a real, reproducible
            // breakage behind an eventual flake.
            ExpectedOutcome::Fail => 1,
            ExpectedOutcome::Pass if !self.retries_enabled => 1,
            ExpectedOutcome::Pass => MAX_PASS_ATTEMPTS,
            ExpectedOutcome::Skip => 0,
        }
    }
}

/// Returns true if the observed attempt result satisfies the declared
/// expectation.
pub fn matches_expectation(expected: ExpectedOutcome, result: AttemptResult) -> bool {
    match expected {
        ExpectedOutcome::Pass => result.is_pass(),
        ExpectedOutcome::Fail => result.is_body_failure(),
        ExpectedOutcome::Skip => true,
    }
}

fn final_result_of(result: AttemptResult) -> FinalResult {
    match result {
        AttemptResult::Pass => FinalResult::Passed,
        AttemptResult::Fail | AttemptResult::Timeout | AttemptResult::ExecFail => {
            FinalResult::Failed
        }
        AttemptResult::CleanupFail => FinalResult::Errored,
    }
}

/// The terminal result of a test after all attempts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalResult {
    /// The last attempt passed.
    Passed,
    /// The last attempt failed (nonzero exit, timeout, or launch failure).
    Failed,
    /// The manifest declared the test skipped; nothing ran.
    Skipped,
    /// The test could not be evaluated (missing script, cleanup failure).
    Errored,
}

impl FinalResult {
    /// Returns the lowercase display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Errored => "errored",
        }
    }
}

/// Information about executions of a test, including retries.
#[derive(Clone, Debug)]
pub struct ExecutionStatuses {
    /// This is guaranteed to be non-empty.
    statuses: Vec<ExecuteStatus>,
}

#[allow(clippy::len_without_is_empty)] // never empty
impl ExecutionStatuses {
    fn new(statuses: Vec<ExecuteStatus>) -> Self {
        Self { statuses }
    }

    /// Returns the last execution status.
    ///
    /// This status determines the test's final result.
    pub fn last_status(&self) -> &ExecuteStatus {
        self.statuses
            .last()
            .expect("execution statuses is non-empty")
    }

    /// Iterates over all the statuses.
    pub fn iter(&self) -> impl Iterator<Item = &'_ ExecuteStatus> + '_ {
        self.statuses.iter()
    }

    /// Returns the number of times the test was executed.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns true if the test passed but took more than one attempt.
    pub fn flaky(&self) -> bool {
        self.statuses.len() > 1 && self.last_status().result.is_pass()
    }
}

/// How a test reached its terminal state.
#[derive(Clone, Debug)]
pub enum RecordKind {
    /// Declared skipped; zero attempts.
    Skipped,
    /// The script file did not exist; zero attempts.
    FileMissing,
    /// The test was attempted at least once.
    Executed(ExecutionStatuses),
}

/// The durable result of one test.
///
/// The descriptor is borrowed from the manifest that produced it.
#[derive(Clone, Debug)]
pub struct TestRecord<'m> {
    /// The test this record is for.
    pub descriptor: &'m TestDescriptor,
    /// How the terminal state was reached.
    pub kind: RecordKind,
    /// The terminal result.
    pub final_result: FinalResult,
    /// Whether the result satisfies the manifest's expectation.
    pub matches_expectation: bool,
}

impl TestRecord<'_> {
    /// The attempts that were executed. Empty for skipped and missing-file
    /// records.
    pub fn attempts(&self) -> &[ExecuteStatus] {
        match &self.kind {
            RecordKind::Executed(statuses) => &statuses.statuses,
            RecordKind::Skipped | RecordKind::FileMissing => &[],
        }
    }

    /// Total time across all attempts.
    pub fn time_taken(&self) -> Duration {
        self.attempts().iter().map(|s| s.time_taken).sum()
    }

    /// Returns true if the test passed only after retries.
    pub fn flaky(&self) -> bool {
        match &self.kind {
            RecordKind::Executed(statuses) => statuses.flaky(),
            _ => false,
        }
    }

    /// The human-facing classification label for report lines.
    pub fn classification_label(&self) -> &'static str {
        if self.matches_expectation {
            match self.final_result {
                FinalResult::Passed => "passed",
                FinalResult::Failed => "failed (expected)",
                FinalResult::Skipped => "skipped",
                // Matched records are never errored.
                FinalResult::Errored => "errored",
            }
        } else {
            match self.final_result {
                FinalResult::Passed => "UNEXPECTED PASS",
                FinalResult::Failed => "UNEXPECTED FAIL",
                FinalResult::Errored => "errored",
                // Mismatched records are never skipped.
                FinalResult::Skipped => "skipped",
            }
        }
    }
}

/// An event emitted while a run progresses.
///
/// `'r` borrows from the runner's per-event state, `'m` from the manifest.
#[derive(Debug)]
pub enum TestEvent<'r, 'm> {
    /// The run is starting.
    RunStarted {
        /// Number of tests selected for this run.
        test_count: usize,
    },

    /// A test is about to be evaluated.
    TestStarted {
        /// The test being evaluated.
        descriptor: &'m TestDescriptor,
    },

    /// An attempt did not match expectation and will be retried after
    /// `delay`.
    AttemptFailedWillRetry {
        /// The test being evaluated.
        descriptor: &'m TestDescriptor,
        /// The attempt that just failed.
        status: &'r ExecuteStatus,
        /// The pause before the next attempt.
        delay: Duration,
    },

    /// A test reached its terminal state.
    TestFinished {
        /// The terminal record.
        record: &'r TestRecord<'m>,
        /// Running statistics including this record.
        current_stats: &'r RunStats,
    },

    /// The run is complete.
    RunFinished {
        /// Final statistics.
        stats: &'r RunStats,
        /// Total wall-clock duration of the run.
        elapsed: Duration,
    },
}

/// Statistics for a test run.
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of tests selected at the beginning of the run.
    pub initial_run_count: usize,

    /// The number of tests that finished running.
    pub finished_count: usize,

    /// The number of tests whose result matched expectation (observed passes
    /// and expected failures alike).
    pub passed: usize,

    /// The number of matched tests that passed only after retries.
    pub flaky: usize,

    /// The number of tests whose result did not match expectation.
    pub failed: usize,

    /// The number of tests skipped by the manifest.
    pub skipped: usize,

    /// The number of tests that could not be evaluated at all.
    pub errored: usize,

    /// Tests that passed but were expected to fail.
    pub unexpected_pass: usize,

    /// Tests that failed or errored but were expected to pass.
    pub unexpected_fail: usize,

    /// Names of unexpectedly-failing tests, in first-encountered order.
    pub unexpected_failures: Vec<String>,

    /// Names of unexpectedly-passing tests, in first-encountered order.
    pub unexpected_passes: Vec<String>,
}

impl RunStats {
    /// Returns true if this run is considered a success: every observed
    /// result matched its declared expectation.
    pub fn is_success(&self) -> bool {
        self.unexpected_pass == 0 && self.unexpected_fail == 0
    }

    fn on_test_finished(&mut self, record: &TestRecord<'_>) {
        self.finished_count += 1;
        if record.final_result == FinalResult::Errored {
            self.errored += 1;
        }

        if record.matches_expectation {
            if record.final_result == FinalResult::Skipped {
                self.skipped += 1;
            } else {
                self.passed += 1;
                if record.flaky() {
                    self.flaky += 1;
                }
            }
        } else {
            self.failed += 1;
            if record.final_result == FinalResult::Passed {
                self.unexpected_pass += 1;
                self.unexpected_passes.push(record.descriptor.name.clone());
            } else {
                self.unexpected_fail += 1;
                self.unexpected_failures.push(record.descriptor.name.clone());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn execution_statuses(statuses: Vec<ExecuteStatus>) -> ExecutionStatuses {
        ExecutionStatuses::new(statuses)
    }
}
