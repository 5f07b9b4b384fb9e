// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Construction of shell command lines.
//!
//! Every interaction with the server goes through the interactive shell
//! binary, either as an `--eval` snippet (cleanup, announce, verification) or
//! as a script run (the test body). This module owns the shared argv layout:
//! `[shell, connection-string, security-flags..., files-or-eval...]`.

use crate::{connection::ConnectionDescriptor, errors::EvalError};
use camino::{Utf8Path, Utf8PathBuf};
use std::{process::Stdio, time::Duration};

/// The shell binary name searched for on `PATH` when none is configured.
pub const DEFAULT_SHELL_NAME: &str = "mongo";

/// Searches `PATH` for an executable with the given name.
pub fn find_on_path(name: &str) -> Option<Utf8PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Utf8PathBuf::from_path_buf(candidate).ok();
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Captured output of an `--eval` invocation.
#[derive(Clone, Debug)]
pub struct EvalOutput {
    /// The exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl EvalOutput {
    /// Returns true if the shell exited 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Shared context for building shell invocations.
#[derive(Clone, Debug)]
pub struct ShellContext {
    program: Utf8PathBuf,
    connection: ConnectionDescriptor,
}

impl ShellContext {
    /// Creates a new context for the given shell binary and connection.
    pub fn new(program: Utf8PathBuf, connection: ConnectionDescriptor) -> Self {
        Self {
            program,
            connection,
        }
    }

    /// The shell binary.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The parsed connection descriptor.
    pub fn connection(&self) -> &ConnectionDescriptor {
        &self.connection
    }

    /// The argv common to every invocation: program, connection string, and
    /// transport security flags.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![self.connection.as_str().to_owned()];
        args.extend(
            self.connection
                .security_flags()
                .into_iter()
                .map(str::to_owned),
        );
        args
    }

    /// Builds a command evaluating an inline script.
    pub fn eval_command(&self, script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.base_args())
            .arg("--eval")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Builds a command running a sequence of script files.
    pub fn script_command(&self, files: &[&Utf8Path]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.base_args())
            .args(files.iter().map(|f| f.as_str()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// The argv of a script run, joined for logs.
    pub fn display_script_command(&self, files: &[&Utf8Path]) -> String {
        let mut argv = vec![self.program.to_string()];
        argv.extend(self.base_args());
        argv.extend(files.iter().map(|f| f.to_string()));
        shell_words::join(argv)
    }

    /// Runs an eval snippet with a bounded lifetime, capturing output.
    ///
    /// A nonzero exit is returned as `Ok` with the captured output: callers
    /// decide whether that constitutes failure.
    pub(crate) async fn run_eval(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<EvalOutput, EvalError> {
        let mut cmd = self.eval_command(script);
        let child = cmd.spawn().map_err(|error| EvalError::Spawn {
            program: self.program.clone(),
            error,
        })?;

        // kill_on_drop reaps the child when the timeout drops the future.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(EvalError::Spawn {
                    program: self.program.clone(),
                    error,
                });
            }
            Err(_) => {
                return Err(EvalError::Timeout {
                    program: self.program.clone(),
                    timeout,
                });
            }
        };

        Ok(EvalOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`run_eval`](Self::run_eval), but maps any non-success exit to an
    /// error.
    pub(crate) async fn run_eval_checked(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<EvalOutput, EvalError> {
        let output = self.run_eval(script, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(EvalError::Failed {
                program: self.program.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> ShellContext {
        let connection = ConnectionDescriptor::parse(
            "mongodb://u:p@localhost:10260/?tls=true&tlsAllowInvalidCertificates=true",
        )
        .unwrap();
        ShellContext::new("/usr/bin/mongo".into(), connection)
    }

    #[test]
    fn eval_command_argv_layout() {
        let ctx = context();
        let cmd = ctx.eval_command("db.runCommand({ping: 1})");
        let argv: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "mongodb://u:p@localhost:10260/?tls=true&tlsAllowInvalidCertificates=true",
                "--tls",
                "--tlsAllowInvalidCertificates",
                "--eval",
                "db.runCommand({ping: 1})",
            ]
        );
    }

    #[test]
    fn script_command_preserves_file_order() {
        let ctx = context();
        let files = [
            Utf8Path::new("/harness/helper.js"),
            Utf8Path::new("/harness/commonsetup.js"),
            Utf8Path::new("/corpus/jstests/core/find.js"),
        ];
        let cmd = ctx.script_command(&files);
        let argv: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv[argv.len() - 3..], [
            "/harness/helper.js".to_owned(),
            "/harness/commonsetup.js".to_owned(),
            "/corpus/jstests/core/find.js".to_owned(),
        ]);
    }

    #[test]
    fn display_joins_and_quotes() {
        let ctx = context();
        let display = ctx.display_script_command(&[Utf8Path::new("/corpus/a b.js")]);
        assert!(display.starts_with("/usr/bin/mongo "), "{display}");
        assert!(display.contains("'/corpus/a b.js'"), "{display}");
    }

    #[cfg(unix)]
    #[test]
    fn find_on_path_locates_sh() {
        // `sh` is present on any Unix system this crate's tests run on.
        assert!(find_on_path("sh").is_some());
    }
}
