// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test isolation: dropping user state between runs.
//!
//! Tests share one server, so any state a test leaves behind is visible to
//! the next one. Before each attempt the controller drops every non-system
//! collection in every non-reserved database, issued as a single scripted
//! command to bound round trips. Cleanup failure is fatal for the attempt:
//! running a test against unknown state produces results that can't be
//! trusted in either direction.

use crate::{
    errors::{CleanupError, EvalError, VerifyCleanError},
    shell::ShellContext,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Databases never touched by cleanup.
pub const RESERVED_DATABASES: &[&str] = &["admin", "config", "local"];

/// Collections with this name prefix are never dropped.
pub const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// How many times the drop command is issued before giving up.
pub const DROP_RETRY_COUNT: u32 = 3;

/// Bound on a single drop invocation. Combined with [`DROP_RETRY_COUNT`],
/// cleanup blocks for at most ~30 seconds.
const DROP_TIMEOUT: Duration = Duration::from_secs(10);

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

// Mirrors RESERVED_DATABASES and SYSTEM_COLLECTION_PREFIX; the tests keep the
// two in sync.
const DROP_SCRIPT: &str = r"
var dbs = db.getMongo().getDBNames();
for (var i in dbs) {
    var dbName = dbs[i];
    if (dbName == 'admin' || dbName == 'config' || dbName == 'local') {
        continue;
    }
    var database = db.getMongo().getDB(dbName);
    var colls = database.getCollectionNames();
    for (var j in colls) {
        var collName = colls[j];
        if (collName.startsWith('system.')) {
            continue;
        }
        database.getCollection(collName).drop();
    }
}
";

const VERIFY_SCRIPT: &str = r"
var leftovers = [];
var dbs = db.getMongo().getDBNames();
for (var i in dbs) {
    var dbName = dbs[i];
    if (dbName == 'admin' || dbName == 'config' || dbName == 'local') {
        continue;
    }
    var database = db.getMongo().getDB(dbName);
    var colls = database.getCollectionNames();
    for (var j in colls) {
        var collName = colls[j];
        if (collName.startsWith('system.')) {
            continue;
        }
        leftovers.push(dbName + '.' + collName);
    }
}
if (leftovers.length > 0) {
    print('LEFTOVER:' + leftovers.join(','));
    quit(1);
}
";

/// Guarantees no database-visible state leaks across tests.
#[derive(Clone, Debug)]
pub struct IsolationController {
    shell: ShellContext,
    drop_enabled: bool,
}

impl IsolationController {
    /// Creates a controller. When `drop_enabled` is false,
    /// [`drop_all_user_state`](Self::drop_all_user_state) is a no-op; the
    /// toggle exists for corpora that manage their own state.
    pub fn new(shell: ShellContext, drop_enabled: bool) -> Self {
        Self {
            shell,
            drop_enabled,
        }
    }

    /// Drops every non-system collection in every non-reserved database.
    ///
    /// Retries up to [`DROP_RETRY_COUNT`] times with immediate re-issue; a
    /// transient connection blip should not abort a corpus run, but backoff
    /// across thousands of tests would be prohibitive.
    pub async fn drop_all_user_state(&self) -> Result<(), CleanupError> {
        if !self.drop_enabled {
            return Ok(());
        }

        let mut last = None;
        for attempt in 1..=DROP_RETRY_COUNT {
            match self.shell.run_eval_checked(DROP_SCRIPT, DROP_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(error) => {
                    debug!(
                        "cleanup attempt {attempt}/{DROP_RETRY_COUNT} failed: {error}"
                    );
                    last = Some(error);
                }
            }
        }

        Err(CleanupError {
            attempts: DROP_RETRY_COUNT,
            last: last.expect("at least one drop attempt was made"),
        })
    }

    /// Re-queries for leftover non-system collections after a drop.
    ///
    /// A belt-and-suspenders check, distinct from the drop itself and never a
    /// substitute for it.
    pub async fn verify_clean(&self) -> Result<(), VerifyCleanError> {
        let output = self.shell.run_eval(VERIFY_SCRIPT, DROP_TIMEOUT).await?;
        if output.success() {
            return Ok(());
        }
        let leftovers = parse_leftovers(&output.stdout);
        if leftovers.is_empty() {
            // Nonzero exit without the marker line: the script itself failed.
            Err(VerifyCleanError::Eval(EvalError::Failed {
                program: self.shell.program().to_owned(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }))
        } else {
            Err(VerifyCleanError::Leftovers { leftovers })
        }
    }

    /// Logs the test's name to the server so server-side logs can be
    /// correlated with harness results. Best-effort: failure is logged and
    /// ignored.
    pub async fn announce(&self, test_name: &str) {
        let script = format!(
            "db.runCommand({{'TESTCASE: {}': 1}})",
            escape_js_single_quoted(test_name)
        );
        match self.shell.run_eval(&script, ANNOUNCE_TIMEOUT).await {
            Ok(output) => {
                // Servers that reject the unknown command still logged it;
                // only a connection-level failure is worth noting.
                if !output.success()
                    && !output.stdout.to_lowercase().contains("command not found")
                {
                    warn!(
                        "could not announce `{test_name}` to the server \
                         (connection issue?)"
                    );
                }
            }
            Err(error) => {
                debug!("announce for `{test_name}` failed: {error}");
            }
        }
    }
}

fn parse_leftovers(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("LEFTOVER:"))
        .flat_map(|names| names.split(','))
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

fn escape_js_single_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scripts_skip_reserved_state() {
        for script in [DROP_SCRIPT, VERIFY_SCRIPT] {
            for db in RESERVED_DATABASES {
                assert!(script.contains(&format!("'{db}'")), "missing {db}");
            }
            assert!(script.contains(&format!("startsWith('{SYSTEM_COLLECTION_PREFIX}')")));
        }
    }

    #[test]
    fn leftover_parsing() {
        assert_eq!(
            parse_leftovers("noise\nLEFTOVER:test.foo,test.bar\n"),
            vec!["test.foo".to_owned(), "test.bar".to_owned()]
        );
        assert_eq!(parse_leftovers("all clean\n"), Vec::<String>::new());
        assert_eq!(parse_leftovers("LEFTOVER:\n"), Vec::<String>::new());
    }

    #[test]
    fn announce_names_are_escaped() {
        assert_eq!(
            escape_js_single_quoted(r"quoting's\tricky.js"),
            r"quoting\'s\\tricky.js"
        );
    }
}
