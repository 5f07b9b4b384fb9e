// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading test descriptors from a tabular manifest.
//!
//! The manifest is a CSV file with a header row carrying at least `test_name`
//! and `expected_outcome` columns. `#`-prefixed lines and blank lines are
//! comments and formatting noise; rows with an empty test name are skipped the
//! same way. An unrecognized expected outcome aborts the load: a typo in a
//! manifest should fail fast, not surface halfway through a multi-hour run.

use crate::errors::{FilterParseError, ManifestLoadError};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;

/// The outcome a manifest row declares for its test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExpectedOutcome {
    /// The test is expected to exit 0.
    Pass,
    /// The test is expected to exit nonzero.
    Fail,
    /// The test must not be executed at all.
    Skip,
}

impl ExpectedOutcome {
    /// Parses an outcome from its manifest spelling, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }

    /// Returns the canonical manifest spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }

    /// Returns the accepted manifest spellings.
    pub fn variants() -> &'static [&'static str] {
        &["pass", "fail", "skip"]
    }
}

/// A single test declared by the manifest.
///
/// Descriptors are immutable once loaded; the rest of the engine references
/// them rather than copying.
#[derive(Clone, Debug)]
pub struct TestDescriptor {
    /// The name as declared in the manifest. Unique within a run.
    pub name: String,
    /// The declared expected outcome.
    pub expected: ExpectedOutcome,
    /// The resolved path to the opaque test program.
    pub script_path: Utf8PathBuf,
}

/// An optional include filter narrowing the loaded test list.
///
/// The pattern is matched against the raw declared name (search semantics),
/// never against the resolved script path.
#[derive(Clone, Debug)]
pub struct NameFilter {
    pattern: Regex,
}

impl NameFilter {
    /// Compiles a filter from a regex pattern.
    pub fn new(pattern: &str) -> Result<Self, FilterParseError> {
        let regex =
            Regex::new(pattern).map_err(|error| FilterParseError::new(pattern, error))?;
        Ok(Self { pattern: regex })
    }

    /// Returns true if the declared name matches the filter.
    pub fn is_match(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    test_name: Option<String>,
    expected_outcome: Option<String>,
}

/// The ordered list of tests selected for a run.
#[derive(Clone, Debug)]
pub struct TestManifest {
    tests: Vec<TestDescriptor>,
}

impl TestManifest {
    /// Loads descriptors from `path`, resolving script paths against
    /// `corpus_dir` and applying `filter` when present.
    ///
    /// File order is preserved: reports must be reproducible across runs of
    /// the same manifest.
    pub fn load(
        path: &Utf8Path,
        corpus_dir: &Utf8Path,
        filter: Option<&NameFilter>,
    ) -> Result<Self, ManifestLoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|error| ManifestLoadError::Read {
                path: path.to_owned(),
                error,
            })?;

        let headers = reader
            .headers()
            .map_err(|error| ManifestLoadError::Read {
                path: path.to_owned(),
                error,
            })?
            .clone();
        for column in ["test_name", "expected_outcome"] {
            if !headers.iter().any(|h| h == column) {
                return Err(ManifestLoadError::MissingColumn {
                    path: path.to_owned(),
                    column,
                });
            }
        }

        let mut tests = Vec::new();
        for row in reader.deserialize::<ManifestRow>() {
            let row = row.map_err(|error| ManifestLoadError::Row {
                path: path.to_owned(),
                error,
            })?;

            // Hand-edited manifests accumulate half-filled rows; an empty
            // test name is formatting noise, not an error.
            let name = match row.test_name {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };

            let outcome_value = row
                .expected_outcome
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ManifestLoadError::MissingOutcome {
                    test_name: name.clone(),
                })?;
            let expected = ExpectedOutcome::parse(&outcome_value).ok_or_else(|| {
                ManifestLoadError::UnrecognizedOutcome {
                    test_name: name.clone(),
                    value: outcome_value,
                }
            })?;

            if let Some(filter) = filter {
                if !filter.is_match(&name) {
                    continue;
                }
            }

            let script_path = resolve_script_path(corpus_dir, &name);
            tests.push(TestDescriptor {
                name,
                expected,
                script_path,
            });
        }

        Ok(Self { tests })
    }

    /// Returns the number of selected tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if no tests were selected.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Iterates over descriptors in manifest order.
    pub fn iter(&self) -> impl Iterator<Item = &'_ TestDescriptor> + '_ {
        self.tests.iter()
    }
}

/// Resolves a declared test name to a script path.
///
/// Names that start with the corpus directory's own final component (e.g.
/// `jstests/core/find.js` for a corpus at `/repo/jstests`) are rooted at the
/// corpus *parent*; anything else is a child of the corpus directory.
pub fn resolve_script_path(corpus_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    if let Some(corpus_component) = corpus_dir.file_name() {
        if name.strip_prefix(corpus_component).is_some_and(|rest| rest.starts_with('/')) {
            if let Some(parent) = corpus_dir.parent() {
                return parent.join(name);
            }
        }
    }
    corpus_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn write_manifest(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("tests.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_preserves_order_and_skips_noise() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r"
                # corpus manifest
                test_name,expected_outcome

                basic/insert.js,pass
                ,fail
                # a comment between rows
                basic/remove.js,FAIL
                aggregation/group.js,Skip
            "},
        );

        let manifest =
            TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), None).unwrap();
        let names: Vec<_> = manifest.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["basic/insert.js", "basic/remove.js", "aggregation/group.js"]
        );
        let outcomes: Vec<_> = manifest.iter().map(|t| t.expected).collect();
        assert_eq!(
            outcomes,
            vec![
                ExpectedOutcome::Pass,
                ExpectedOutcome::Fail,
                ExpectedOutcome::Skip
            ]
        );
    }

    #[test]
    fn unrecognized_outcome_is_fatal() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r"
                test_name,expected_outcome
                basic/insert.js,maybe
            "},
        );

        let err = TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), None)
            .expect_err("load should fail");
        assert!(
            matches!(
                &err,
                ManifestLoadError::UnrecognizedOutcome { test_name, value }
                    if test_name == "basic/insert.js" && value == "maybe"
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn missing_column_is_fatal() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r"
                test_name,notes
                basic/insert.js,flaky on CI
            "},
        );

        let err = TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), None)
            .expect_err("load should fail");
        assert!(
            matches!(
                err,
                ManifestLoadError::MissingColumn {
                    column: "expected_outcome",
                    ..
                }
            ),
        );
    }

    #[test]
    fn row_without_outcome_is_fatal() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r"
                test_name,expected_outcome
                basic/insert.js
            "},
        );

        let err = TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), None)
            .expect_err("load should fail");
        assert!(matches!(err, ManifestLoadError::MissingOutcome { .. }));
    }

    #[test]
    fn filter_matches_declared_name_not_resolved_path() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r"
                test_name,expected_outcome
                basic/insert.js,pass
                aggregation/group.js,pass
            "},
        );

        // `corpus` appears in every resolved path; a filter on it must match
        // nothing because filters see only declared names.
        let filter = NameFilter::new("corpus").unwrap();
        let manifest =
            TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), Some(&filter)).unwrap();
        assert!(manifest.is_empty());

        let filter = NameFilter::new("^basic/").unwrap();
        let manifest =
            TestManifest::load(&path, Utf8Path::new("/corpus/jstests"), Some(&filter)).unwrap();
        let names: Vec<_> = manifest.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["basic/insert.js"]);
    }

    #[test]
    fn invalid_filter_pattern_errors() {
        assert!(NameFilter::new("[unclosed").is_err());
    }

    #[test]
    fn prefixed_names_resolve_against_corpus_parent() {
        let corpus = Utf8Path::new("/repo/jstests");
        assert_eq!(
            resolve_script_path(corpus, "jstests/core/find.js"),
            Utf8PathBuf::from("/repo/jstests/core/find.js")
        );
        assert_eq!(
            resolve_script_path(corpus, "core/find.js"),
            Utf8PathBuf::from("/repo/jstests/core/find.js")
        );
        // A name that merely shares the prefix text is still a child.
        assert_eq!(
            resolve_script_path(corpus, "jstests_extra/find.js"),
            Utf8PathBuf::from("/repo/jstests/jstests_extra/find.js")
        );
    }
}
