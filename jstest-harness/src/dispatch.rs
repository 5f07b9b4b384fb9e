// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result},
    output::{OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use jstest_runner::{
    connection::ConnectionDescriptor,
    errors::WriteEventError,
    leak::LeakCheckOptions,
    manifest::{NameFilter, TestManifest},
    reporter::{ReporterOutput, TestReporterBuilder},
    runner::TestRunnerBuilder,
    shell::{find_on_path, ShellContext, DEFAULT_SHELL_NAME},
};
use std::io::{BufWriter, Write};
use tracing::{info, warn};

/// A conformance harness for database-shell test corpora.
///
/// Runs each test listed in a manifest against a DocumentDB-compatible
/// server, compares the outcome with the manifest's expectation, and exits
/// nonzero when any result is unexpected.
#[derive(Debug, Parser)]
#[command(name = "jstest-harness", version)]
pub struct JstestApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl JstestApp {
    /// Executes the app, returning the process exit code.
    pub fn exec(self) -> Result<i32> {
        let ctx = self.output.init();
        match self.command {
            Command::Run(opts) => opts.exec(ctx),
            Command::List(opts) => opts.exec(ctx),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tests selected by the manifest
    Run(Box<RunOpts>),
    /// List the tests selected by the manifest, without running anything
    List(ListOpts),
}

#[derive(Debug, Args)]
#[command(next_help_heading = "CORPUS OPTIONS")]
struct CorpusOpts {
    /// Path to the test corpus directory
    #[arg(long, value_name = "DIR", default_value = "jstests")]
    corpus_dir: Utf8PathBuf,

    /// Path to the test manifest
    #[arg(long, value_name = "PATH", default_value = "tests.csv")]
    manifest: Utf8PathBuf,

    /// Run only tests whose declared name matches this pattern
    #[arg(long, value_name = "REGEX")]
    filter: Option<String>,
}

impl CorpusOpts {
    fn name_filter(&self) -> Result<Option<NameFilter>> {
        Ok(self
            .filter
            .as_deref()
            .map(NameFilter::new)
            .transpose()?)
    }

    fn load_manifest(&self) -> Result<TestManifest> {
        let filter = self.name_filter()?;
        Ok(TestManifest::load(
            &self.manifest,
            &self.corpus_dir,
            filter.as_ref(),
        )?)
    }
}

#[derive(Debug, Args)]
struct RunOpts {
    #[clap(flatten)]
    corpus: CorpusOpts,

    /// Path to the shell binary [default: find `mongo` on PATH]
    #[arg(long, value_name = "PATH", help_heading = "SHELL OPTIONS")]
    shell: Option<Utf8PathBuf>,

    /// Server connection string
    #[arg(
        long,
        value_name = "URI",
        env = "MONGO_CONNECTION_STRING",
        default_value = "mongodb://localhost:27017",
        help_heading = "SHELL OPTIONS"
    )]
    connection_string: String,

    /// Setup script loaded before every test
    #[arg(
        long,
        value_name = "PATH",
        default_value = "commonsetup.js",
        help_heading = "SHELL OPTIONS"
    )]
    common_setup: Utf8PathBuf,

    /// TLS helper script, loaded when the file exists
    #[arg(
        long,
        value_name = "PATH",
        default_value = "sslEnabledParallelShell.js",
        help_heading = "SHELL OPTIONS"
    )]
    ssl_helper: Utf8PathBuf,

    /// Skip dropping collections before each test
    #[arg(long, help_heading = "ISOLATION OPTIONS")]
    no_drop_collections: bool,

    /// Re-query for leftover collections after each cleanup
    #[arg(long, help_heading = "ISOLATION OPTIONS")]
    verify_cleanup: bool,

    /// Never retry tests that are expected to pass
    #[arg(long, help_heading = "RETRY OPTIONS")]
    no_retries: bool,

    /// Check the storage engine for leaked sessions after each attempt
    #[arg(long, help_heading = "LEAK DETECTION")]
    check_leaks: bool,

    /// Storage engine host for leak detection
    #[arg(
        long,
        value_name = "HOST",
        default_value = "localhost",
        help_heading = "LEAK DETECTION"
    )]
    pg_host: String,

    /// Storage engine port for leak detection
    #[arg(
        long,
        value_name = "PORT",
        default_value_t = 5432,
        help_heading = "LEAK DETECTION"
    )]
    pg_port: u16,

    /// Storage engine role for leak detection
    #[arg(long, value_name = "USER", help_heading = "LEAK DETECTION")]
    pg_user: Option<String>,

    /// Directory for per-test logs of unexpected results
    #[arg(
        long,
        value_name = "DIR",
        default_value = "test-results",
        help_heading = "OUTPUT OPTIONS"
    )]
    output_dir: Utf8PathBuf,

    /// Number of parallel workers (reserved; only 1 is supported)
    #[arg(
        long,
        value_name = "N",
        default_value_t = 1,
        help_heading = "RUNNER OPTIONS"
    )]
    parallel: usize,
}

impl RunOpts {
    fn exec(self, ctx: OutputContext) -> Result<i32> {
        let Self {
            corpus,
            shell,
            connection_string,
            common_setup,
            ssl_helper,
            no_drop_collections,
            verify_cleanup,
            no_retries,
            check_leaks,
            pg_host,
            pg_port,
            pg_user,
            output_dir,
            parallel,
        } = self;

        let connection = ConnectionDescriptor::parse(&connection_string)?;
        let shell = match shell {
            Some(shell) => shell,
            None => find_on_path(DEFAULT_SHELL_NAME).ok_or(ExpectedError::ShellNotFound {
                name: DEFAULT_SHELL_NAME,
            })?,
        };
        let manifest = corpus.load_manifest()?;

        info!("loaded {} test(s) from {}", manifest.len(), corpus.manifest);
        info!("using shell: {shell}");
        info!("connecting to: {}", connection.display_redacted());
        info!("writing unexpected-result logs to {output_dir}");
        if parallel != 1 {
            warn!("parallel execution is not implemented; running sequentially");
        }

        let mut builder = TestRunnerBuilder::default();
        builder
            .set_drop_collections(!no_drop_collections)
            .set_retries(!no_retries)
            .set_verify_cleanup(verify_cleanup);
        if check_leaks {
            builder.set_leak_check(Some(LeakCheckOptions {
                host: pg_host,
                port: pg_port,
                user: pg_user,
            }));
        }

        let runner = builder.build(
            ShellContext::new(shell, connection),
            corpus.corpus_dir.clone(),
            common_setup,
            Some(ssl_helper),
        )?;

        let mut reporter_builder = TestReporterBuilder::default();
        reporter_builder.set_verbose(ctx.verbose);
        let mut reporter = reporter_builder.build(output_dir, ReporterOutput::Terminal);
        if ctx.color.should_colorize(supports_color::Stream::Stdout) {
            reporter.colorize();
        }

        let stats = runner.try_execute(&manifest, |event| reporter.report_event(event))?;

        Ok(if stats.is_success() { 0 } else { 1 })
    }
}

#[derive(Debug, Args)]
struct ListOpts {
    #[clap(flatten)]
    corpus: CorpusOpts,
}

impl ListOpts {
    fn exec(self, _ctx: OutputContext) -> Result<i32> {
        let manifest = self.corpus.load_manifest()?;

        let mut writer = BufWriter::new(std::io::stdout());
        for test in manifest.iter() {
            writeln!(writer, "{:<5} {}", test.expected.as_str(), test.name)
                .map_err(|error| ExpectedError::from(WriteEventError::Io(error)))?;
        }
        writer
            .flush()
            .map_err(|error| ExpectedError::from(WriteEventError::Io(error)))?;

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        JstestApp::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let app = JstestApp::parse_from(["jstest-harness", "run"]);
        let Command::Run(opts) = app.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(opts.corpus.corpus_dir, "jstests");
        assert_eq!(opts.corpus.manifest, "tests.csv");
        assert_eq!(opts.parallel, 1);
        assert!(!opts.no_retries);
        assert!(!opts.check_leaks);
        assert_eq!(opts.pg_port, 5432);
    }

    #[test]
    fn run_toggle_flags_parse() {
        let app = JstestApp::parse_from([
            "jstest-harness",
            "run",
            "--no-drop-collections",
            "--no-retries",
            "--verify-cleanup",
            "--check-leaks",
            "--pg-host",
            "dbhost",
            "--filter",
            "^basic/",
        ]);
        let Command::Run(opts) = app.command else {
            panic!("expected run subcommand");
        };
        assert!(opts.no_drop_collections);
        assert!(opts.no_retries);
        assert!(opts.verify_cleanup);
        assert!(opts.check_leaks);
        assert_eq!(opts.pg_host, "dbhost");
        assert_eq!(opts.corpus.filter.as_deref(), Some("^basic/"));
    }
}
