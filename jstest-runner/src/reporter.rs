// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out and aggregates test execution statuses.
//!
//! The reporter renders [`TestEvent`]s as they arrive: one line per finished
//! test (streaming, never batched), retry notices, and a final summary block
//! with the unexpected-result name lists that gate CI. Detailed logs are
//! persisted only for records that did not match expectation -- against a
//! corpus of thousands of tests, writing every log would drown the useful
//! ones.

use crate::{
    errors::WriteEventError,
    executor::{AttemptResult, ExecuteStatus},
    helpers::{plural, DisplayAttemptDuration, DisplayHumanDuration},
    runner::{FinalResult, RecordKind, RunStats, TestEvent, TestRecord},
};
use camino::Utf8PathBuf;
use owo_colors::{OwoColorize, Style};
use std::{
    fmt::Write as _,
    io::{self, BufWriter, Write},
};

/// Standard output destination for the reporter.
///
/// This is usually a terminal, but can be an in-memory buffer for tests.
pub enum ReporterOutput<'a> {
    /// Produce output on the (possibly piped) terminal.
    Terminal,
    /// Write output to a buffer.
    Buffer(&'a mut Vec<u8>),
}

/// Test reporter builder.
#[derive(Debug, Default)]
pub struct TestReporterBuilder {
    verbose: bool,
}

impl TestReporterBuilder {
    /// Sets verbose output: per-test start lines and mismatch details on the
    /// console.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Creates a new test reporter writing mismatch logs under `output_dir`.
    pub fn build<'a>(
        &self,
        output_dir: Utf8PathBuf,
        output: ReporterOutput<'a>,
    ) -> TestReporter<'a> {
        TestReporter {
            inner: ReporterImpl {
                styles: Box::default(),
                verbose: self.verbose,
                output_dir,
            },
            output,
        }
    }
}

/// Functionality to report test results to stdout and a results directory.
pub struct TestReporter<'a> {
    inner: ReporterImpl,
    output: ReporterOutput<'a>,
}

impl<'a> TestReporter<'a> {
    /// Colorizes console output.
    pub fn colorize(&mut self) {
        self.inner.styles.colorize();
    }

    /// Reports a single event.
    pub fn report_event(&mut self, event: TestEvent<'_, '_>) -> Result<(), WriteEventError> {
        match &mut self.output {
            ReporterOutput::Terminal => {
                let mut writer = BufWriter::new(io::stdout());
                self.inner.write_event(&event, &mut writer)?;
                // Stream: each event must be visible as soon as it happens.
                writer.flush().map_err(WriteEventError::Io)
            }
            ReporterOutput::Buffer(buf) => self.inner.write_event(&event, buf),
        }
    }
}

#[derive(Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    skip: Style,
    retry: Style,
    count: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.retry = Style::new().yellow();
        self.count = Style::new().bold();
    }
}

struct ReporterImpl {
    styles: Box<Styles>,
    verbose: bool,
    output_dir: Utf8PathBuf,
}

impl ReporterImpl {
    fn write_event(
        &mut self,
        event: &TestEvent<'_, '_>,
        writer: &mut dyn Write,
    ) -> Result<(), WriteEventError> {
        match event {
            TestEvent::RunStarted { test_count } => {
                writeln!(
                    writer,
                    "Running {} {}",
                    test_count.style(self.styles.count),
                    plural::tests_str(*test_count),
                )
                .map_err(WriteEventError::Io)?;
                writeln!(writer).map_err(WriteEventError::Io)?;
            }
            TestEvent::TestStarted { descriptor } => {
                if self.verbose {
                    writeln!(writer, "Running: {}", descriptor.name)
                        .map_err(WriteEventError::Io)?;
                }
            }
            TestEvent::AttemptFailedWillRetry {
                descriptor,
                status,
                delay,
            } => {
                writeln!(
                    writer,
                    "{} {} - attempt {} {} ({}); retrying in {}s",
                    "↻".style(self.styles.retry),
                    descriptor.name,
                    status.attempt,
                    attempt_result_label(status.result),
                    DisplayAttemptDuration(status.time_taken),
                    delay.as_secs(),
                )
                .map_err(WriteEventError::Io)?;
            }
            TestEvent::TestFinished { record, .. } => {
                self.write_status_line(record, writer)?;
                if !record.matches_expectation {
                    self.write_record_log(record)?;
                    if self.verbose {
                        self.write_mismatch_details(record, writer)?;
                    }
                }
            }
            TestEvent::RunFinished { stats, elapsed } => {
                self.write_summary(stats, *elapsed, writer)?;
            }
        }
        Ok(())
    }

    fn write_status_line(
        &self,
        record: &TestRecord<'_>,
        writer: &mut dyn Write,
    ) -> Result<(), WriteEventError> {
        let (symbol, style) = if record.matches_expectation {
            if record.final_result == FinalResult::Skipped {
                ("⊘", self.styles.skip)
            } else {
                ("✓", self.styles.pass)
            }
        } else {
            ("✗", self.styles.fail)
        };

        writeln!(
            writer,
            "{} {} - {} ({})",
            symbol.style(style),
            record.descriptor.name,
            record.classification_label(),
            DisplayAttemptDuration(record.time_taken()),
        )
        .map_err(WriteEventError::Io)
    }

    fn write_mismatch_details(
        &self,
        record: &TestRecord<'_>,
        writer: &mut dyn Write,
    ) -> Result<(), WriteEventError> {
        writeln!(
            writer,
            "  Expected: {}",
            record.descriptor.expected.as_str()
        )
        .map_err(WriteEventError::Io)?;
        if let Some(status) = record.attempts().last() {
            if let Some(code) = status.exit_code {
                writeln!(writer, "  Exit code: {code}").map_err(WriteEventError::Io)?;
            }
            let stderr = status.stderr.trim();
            if !stderr.is_empty() {
                let head: String = stderr.chars().take(200).collect();
                writeln!(writer, "  Error: {head}").map_err(WriteEventError::Io)?;
            }
        } else if let RecordKind::FileMissing = record.kind {
            writeln!(
                writer,
                "  Error: test file not found: {}",
                record.descriptor.script_path
            )
            .map_err(WriteEventError::Io)?;
        }
        Ok(())
    }

    fn write_summary(
        &self,
        stats: &RunStats,
        elapsed: std::time::Duration,
        writer: &mut dyn Write,
    ) -> Result<(), WriteEventError> {
        let bar = "=".repeat(80);
        let mut out = String::new();
        out.push('\n');
        out.push_str(&bar);
        out.push_str("\nTEST SUMMARY\n");
        out.push_str(&bar);
        out.push('\n');
        let _ = writeln!(out, "Total:            {}", stats.initial_run_count);
        let _ = writeln!(out, "Passed:           {}", stats.passed);
        let _ = writeln!(out, "Failed:           {}", stats.failed);
        let _ = writeln!(out, "Skipped:          {}", stats.skipped);
        let _ = writeln!(out, "Flaky:            {}", stats.flaky);
        let _ = writeln!(out, "Errored:          {}", stats.errored);
        let _ = writeln!(out, "Unexpected Pass:  {}", stats.unexpected_pass);
        let _ = writeln!(out, "Unexpected Fail:  {}", stats.unexpected_fail);
        let _ = writeln!(out, "Duration:         {}", DisplayHumanDuration(elapsed));
        out.push_str(&bar);
        out.push('\n');
        writer
            .write_all(out.as_bytes())
            .map_err(WriteEventError::Io)?;

        if !stats.unexpected_failures.is_empty() {
            writeln!(
                writer,
                "\n{}",
                "UNEXPECTED FAILURES:".style(self.styles.fail)
            )
            .map_err(WriteEventError::Io)?;
            for name in &stats.unexpected_failures {
                writeln!(writer, "  {name}").map_err(WriteEventError::Io)?;
            }
        }
        if !stats.unexpected_passes.is_empty() {
            writeln!(
                writer,
                "\n{}",
                "UNEXPECTED PASSES:".style(self.styles.fail)
            )
            .map_err(WriteEventError::Io)?;
            for name in &stats.unexpected_passes {
                writeln!(writer, "  {name}").map_err(WriteEventError::Io)?;
            }
        }
        if !stats.is_success() {
            writeln!(
                writer,
                "\nRe-run just the tests above by passing their names to --filter."
            )
            .map_err(WriteEventError::Io)?;
        }
        Ok(())
    }

    /// Persists the full attempt history of a non-matching record.
    fn write_record_log(&self, record: &TestRecord<'_>) -> Result<(), WriteEventError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|error| WriteEventError::Fs {
            file: self.output_dir.clone(),
            error,
        })?;
        let file = self
            .output_dir
            .join(format!("{}.log", flatten_name(&record.descriptor.name)));

        let mut out = String::new();
        let _ = writeln!(out, "Test: {}", record.descriptor.name);
        let _ = writeln!(out, "Script: {}", record.descriptor.script_path);
        let _ = writeln!(out, "Expected: {}", record.descriptor.expected.as_str());
        let _ = writeln!(out, "Result: {}", record.final_result.as_str());
        let _ = writeln!(out, "Matches Expectation: {}", record.matches_expectation);

        match &record.kind {
            RecordKind::FileMissing => {
                let _ = writeln!(
                    out,
                    "\nTest file not found: {}",
                    record.descriptor.script_path
                );
            }
            RecordKind::Skipped => {}
            RecordKind::Executed(_) => {
                let attempts = record.attempts();
                let _ = writeln!(
                    out,
                    "Attempts: {} {}",
                    attempts.len(),
                    plural::attempts_str(attempts.len()),
                );
                for status in attempts {
                    out.push_str(&format_attempt(status));
                }
            }
        }

        std::fs::write(&file, out).map_err(|error| WriteEventError::Fs { file, error })
    }
}

fn format_attempt(status: &ExecuteStatus) -> String {
    let mut out = String::new();
    let exit_code = match status.exit_code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_owned(),
    };
    let _ = writeln!(
        out,
        "\n=== ATTEMPT {}: {} ({}, {}, started {}) ===",
        status.attempt,
        attempt_result_label(status.result),
        exit_code,
        DisplayAttemptDuration(status.time_taken),
        status.start_time.format("%Y-%m-%d %H:%M:%S"),
    );
    let _ = writeln!(out, "=== STDOUT ===\n{}", status.stdout);
    let _ = writeln!(out, "=== STDERR ===\n{}", status.stderr);
    out
}

fn attempt_result_label(result: AttemptResult) -> &'static str {
    match result {
        AttemptResult::Pass => "passed",
        AttemptResult::Fail => "failed",
        AttemptResult::Timeout => "timed out",
        AttemptResult::ExecFail => "launch failed",
        AttemptResult::CleanupFail => "cleanup failed",
    }
}

/// Flattens a declared test name into a log file stem: path separators would
/// otherwise scatter logs into subdirectories.
fn flatten_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::{ExpectedOutcome, TestDescriptor},
        runner::TestEvent,
    };
    use camino_tempfile::Utf8TempDir;
    use chrono::Local;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn descriptor(name: &str, expected: ExpectedOutcome) -> TestDescriptor {
        TestDescriptor {
            name: name.to_owned(),
            expected,
            script_path: format!("/corpus/{name}").into(),
        }
    }

    fn status(attempt: usize, result: AttemptResult) -> ExecuteStatus {
        ExecuteStatus {
            attempt,
            exit_code: Some(if result == AttemptResult::Pass { 0 } else { 1 }),
            result,
            stdout: format!("out of attempt {attempt}"),
            stderr: format!("err of attempt {attempt}"),
            start_time: Local::now(),
            time_taken: Duration::from_millis(120),
        }
    }

    fn executed_record<'m>(
        descriptor: &'m TestDescriptor,
        results: &[AttemptResult],
        matches: bool,
    ) -> TestRecord<'m> {
        use crate::runner::test_support::execution_statuses;

        let statuses: Vec<_> = results
            .iter()
            .enumerate()
            .map(|(i, result)| status(i + 1, *result))
            .collect();
        let final_result = match results.last().unwrap() {
            AttemptResult::Pass => FinalResult::Passed,
            AttemptResult::CleanupFail => FinalResult::Errored,
            _ => FinalResult::Failed,
        };
        TestRecord {
            descriptor,
            kind: RecordKind::Executed(execution_statuses(statuses)),
            final_result,
            matches_expectation: matches,
        }
    }

    #[test]
    fn status_lines_stream_to_the_buffer() {
        let dir = Utf8TempDir::new().unwrap();
        let mut buf = Vec::new();
        let mut reporter = TestReporterBuilder::default()
            .build(dir.path().to_owned(), ReporterOutput::Buffer(&mut buf));

        let pass = descriptor("basic/insert.js", ExpectedOutcome::Pass);
        let record = executed_record(&pass, &[AttemptResult::Pass], true);
        let stats = RunStats::default();

        reporter
            .report_event(TestEvent::RunStarted { test_count: 1 })
            .unwrap();
        reporter
            .report_event(TestEvent::TestFinished {
                record: &record,
                current_stats: &stats,
            })
            .unwrap();

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("Running 1 test\n"), "{output}");
        assert!(
            output.contains("✓ basic/insert.js - passed ("),
            "{output}"
        );
        // Matching records write no log file.
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "no logs expected"
        );
    }

    #[test]
    fn mismatch_writes_log_with_every_attempt() {
        let dir = Utf8TempDir::new().unwrap();
        let mut buf = Vec::new();
        let mut reporter = TestReporterBuilder::default()
            .build(dir.path().to_owned(), ReporterOutput::Buffer(&mut buf));

        let fail = descriptor("basic/remove.js", ExpectedOutcome::Pass);
        let record = executed_record(
            &fail,
            &[AttemptResult::Fail, AttemptResult::Fail],
            false,
        );
        let stats = RunStats::default();
        reporter
            .report_event(TestEvent::TestFinished {
                record: &record,
                current_stats: &stats,
            })
            .unwrap();

        let output = String::from_utf8(buf).unwrap();
        assert!(
            output.contains("✗ basic/remove.js - UNEXPECTED FAIL ("),
            "{output}"
        );

        let log = std::fs::read_to_string(dir.path().join("basic_remove.js.log")).unwrap();
        assert!(log.contains("Test: basic/remove.js"), "{log}");
        assert!(log.contains("Expected: pass"), "{log}");
        assert!(log.contains("Matches Expectation: false"), "{log}");
        assert!(log.contains("=== ATTEMPT 1: failed"), "{log}");
        assert!(log.contains("=== ATTEMPT 2: failed"), "{log}");
        assert!(log.contains("out of attempt 1"), "{log}");
        assert!(log.contains("err of attempt 2"), "{log}");
    }

    #[test]
    fn summary_block_lists_unexpected_names() {
        let dir = Utf8TempDir::new().unwrap();
        let mut buf = Vec::new();
        let mut reporter = TestReporterBuilder::default()
            .build(dir.path().to_owned(), ReporterOutput::Buffer(&mut buf));

        let stats = RunStats {
            initial_run_count: 4,
            finished_count: 4,
            passed: 1,
            flaky: 1,
            failed: 2,
            skipped: 1,
            errored: 0,
            unexpected_pass: 1,
            unexpected_fail: 1,
            unexpected_failures: vec!["basic/remove.js".to_owned()],
            unexpected_passes: vec!["basic/insert.js".to_owned()],
        };
        reporter
            .report_event(TestEvent::RunFinished {
                stats: &stats,
                elapsed: Duration::from_secs(125),
            })
            .unwrap();

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("TEST SUMMARY"), "{output}");
        assert!(output.contains("Total:            4"), "{output}");
        assert!(output.contains("Unexpected Pass:  1"), "{output}");
        assert!(output.contains("Unexpected Fail:  1"), "{output}");
        assert!(output.contains("Duration:         2m 05s"), "{output}");
        assert!(output.contains("UNEXPECTED FAILURES:\n  basic/remove.js"), "{output}");
        assert!(output.contains("UNEXPECTED PASSES:\n  basic/insert.js"), "{output}");
    }

    #[test]
    fn skip_symbol_and_label() {
        let dir = Utf8TempDir::new().unwrap();
        let mut buf = Vec::new();
        let mut reporter = TestReporterBuilder::default()
            .build(dir.path().to_owned(), ReporterOutput::Buffer(&mut buf));

        let skip = descriptor("slow/huge.js", ExpectedOutcome::Skip);
        let record = TestRecord {
            descriptor: &skip,
            kind: RecordKind::Skipped,
            final_result: FinalResult::Skipped,
            matches_expectation: true,
        };
        let stats = RunStats::default();
        reporter
            .report_event(TestEvent::TestFinished {
                record: &record,
                current_stats: &stats,
            })
            .unwrap();

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("⊘ slow/huge.js - skipped"), "{output}");
    }

    #[test]
    fn flattened_log_names() {
        assert_eq!(flatten_name("basic/insert.js"), "basic_insert.js");
        assert_eq!(flatten_name(r"win\style\x.js"), "win_style_x.js");
        assert_eq!(flatten_name("plain.js"), "plain.js");
    }
}
