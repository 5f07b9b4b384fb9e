// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Advisory detection of leaked server-side sessions.
//!
//! The server's storage engine is a relational database; a test that opens a
//! transaction and never ends it leaves a session sitting `idle in
//! transaction` in the activity view. The detector queries for such sessions
//! after an attempt and reports them as warnings. It is strictly advisory: it
//! never fails a test, and every way it can go wrong degrades to an empty
//! finding set.
//!
//! The probe is capability-checked: a native client binding when the
//! `native-postgres` feature is enabled, falling back to an external `psql`
//! invocation, falling back to reporting nothing.

use crate::shell::find_on_path;
use std::{fmt::Write as _, process::Stdio, time::Duration};
use tracing::debug;

const LEAK_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

// `-At` tuple output splits on `|`; the cast and COALESCE keep every column
// textual and non-null.
const IDLE_IN_TRANSACTION_QUERY: &str = "SELECT pid, COALESCE(usename::text, ''), \
     COALESCE(query, '') FROM pg_stat_activity \
     WHERE state = 'idle in transaction' AND pid <> pg_backend_pid()";

/// Where to find the relational engine backing the server.
#[derive(Clone, Debug)]
pub struct LeakCheckOptions {
    /// The engine host.
    pub host: String,
    /// The engine port.
    pub port: u16,
    /// The role to connect as, when the engine requires one.
    pub user: Option<String>,
}

/// A session found idle inside an open transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeakedSession {
    /// The backend process id.
    pub pid: i32,
    /// The session's role name.
    pub user: String,
    /// The last query the session ran.
    pub query: String,
}

/// Queries the backing storage engine for leaked sessions.
#[derive(Clone, Debug)]
pub struct LeakDetector {
    options: LeakCheckOptions,
}

impl LeakDetector {
    /// Creates a detector for the given engine location.
    pub fn new(options: LeakCheckOptions) -> Self {
        Self { options }
    }

    /// Returns sessions currently idle inside an open transaction, excluding
    /// the detector's own.
    ///
    /// Never fails: backend errors and missing client tooling both produce an
    /// empty set (with a debug log).
    pub async fn idle_transactions(&self) -> Vec<LeakedSession> {
        #[cfg(feature = "native-postgres")]
        {
            match self.query_native().await {
                Ok(sessions) => return sessions,
                Err(error) => {
                    debug!("native leak probe failed, trying psql: {error}");
                }
            }
        }

        self.query_psql().await.unwrap_or_default()
    }

    #[cfg(feature = "native-postgres")]
    async fn query_native(&self) -> Result<Vec<LeakedSession>, tokio_postgres::Error> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.options.host)
            .port(self.options.port)
            .dbname("postgres")
            .connect_timeout(LEAK_QUERY_TIMEOUT);
        if let Some(user) = &self.options.user {
            config.user(user);
        }

        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
        let driver = tokio::spawn(async move {
            let _ = connection.await;
        });

        let rows = client.query(IDLE_IN_TRANSACTION_QUERY, &[]).await?;
        drop(client);
        let _ = driver.await;

        Ok(rows
            .iter()
            .map(|row| LeakedSession {
                pid: row.get(0),
                user: row.get(1),
                query: row.get(2),
            })
            .collect())
    }

    async fn query_psql(&self) -> Option<Vec<LeakedSession>> {
        let psql = find_on_path("psql")?;

        let mut cmd = tokio::process::Command::new(&psql);
        cmd.arg("-h")
            .arg(&self.options.host)
            .arg("-p")
            .arg(self.options.port.to_string())
            .arg("-d")
            .arg("postgres")
            .arg("-At")
            .arg("-F")
            .arg("|")
            .arg("-c")
            .arg(IDLE_IN_TRANSACTION_QUERY)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(user) = &self.options.user {
            cmd.arg("-U").arg(user);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                debug!("could not spawn {psql}: {error}");
                return None;
            }
        };

        let output = match tokio::time::timeout(LEAK_QUERY_TIMEOUT, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                debug!("error waiting for psql: {error}");
                return None;
            }
            Err(_) => {
                debug!("psql leak probe timed out");
                return None;
            }
        };
        if !output.status.success() {
            debug!(
                "psql leak probe exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        Some(parse_tuple_output(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Formats a warning block for appending to an attempt's captured stderr.
    pub fn format_warning(sessions: &[LeakedSession]) -> String {
        let mut out = String::new();
        out.push_str("\n=== LEAKED SESSIONS ===\n");
        let _ = writeln!(
            out,
            "{} session(s) idle in transaction after this test:",
            sessions.len()
        );
        for session in sessions {
            let _ = writeln!(
                out,
                "  pid {} (user {}): {}",
                session.pid, session.user, session.query
            );
        }
        out
    }
}

fn parse_tuple_output(stdout: &str) -> Vec<LeakedSession> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.splitn(3, '|');
            let pid = fields.next()?.trim().parse().ok()?;
            let user = fields.next()?.to_owned();
            let query = fields.next().unwrap_or("").to_owned();
            Some(LeakedSession { pid, user, query })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_psql_tuples() {
        let out = "1234|app|BEGIN\n5678|worker|UPDATE docs SET x = 1|extra pipe\n";
        assert_eq!(
            parse_tuple_output(out),
            vec![
                LeakedSession {
                    pid: 1234,
                    user: "app".to_owned(),
                    query: "BEGIN".to_owned(),
                },
                LeakedSession {
                    pid: 5678,
                    user: "worker".to_owned(),
                    query: "UPDATE docs SET x = 1|extra pipe".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn skips_unparseable_lines() {
        assert_eq!(parse_tuple_output("\nnot a pid|x|y\n"), Vec::new());
    }

    #[test]
    fn warning_lists_every_session() {
        let sessions = vec![
            LeakedSession {
                pid: 1,
                user: "a".to_owned(),
                query: "BEGIN".to_owned(),
            },
            LeakedSession {
                pid: 2,
                user: "b".to_owned(),
                query: "SELECT 1".to_owned(),
            },
        ];
        let warning = LeakDetector::format_warning(&sessions);
        assert!(warning.contains("2 session(s)"));
        assert!(warning.contains("pid 1 (user a): BEGIN"));
        assert!(warning.contains("pid 2 (user b): SELECT 1"));
    }
}
