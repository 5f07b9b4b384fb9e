// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for jstest-runner.

use std::{fmt, time::Duration};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 {
            "test"
        } else {
            "tests"
        }
    }

    /// Returns "attempt" if `count` is 1, otherwise "attempts".
    pub fn attempts_str(count: usize) -> &'static str {
        if count == 1 {
            "attempt"
        } else {
            "attempts"
        }
    }
}

/// Displays a wall-clock duration as h/m/s, omitting higher units when they
/// are zero. Sub-minute durations keep fractional seconds.
pub(crate) struct DisplayHumanDuration(pub(crate) Duration);

impl fmt::Display for DisplayHumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.0.as_secs();
        let secs = total_secs % 60;
        let total_mins = total_secs / 60;
        let mins = total_mins % 60;
        let hours = total_mins / 60;

        if hours > 0 {
            write!(f, "{hours}h {mins:02}m {secs:02}s")
        } else if mins > 0 {
            write!(f, "{mins}m {secs:02}s")
        } else {
            write!(f, "{:.2}s", self.0.as_secs_f64())
        }
    }
}

/// Displays a per-attempt duration in seconds with millisecond precision.
pub(crate) struct DisplayAttemptDuration(pub(crate) Duration);

impl fmt::Display for DisplayAttemptDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Duration::from_millis(450), "0.45s"; "sub second")]
    #[test_case(Duration::from_secs(45), "45.00s"; "seconds only")]
    #[test_case(Duration::from_secs(123), "2m 03s"; "minutes and seconds")]
    #[test_case(Duration::from_secs(3723), "1h 02m 03s"; "hours minutes seconds")]
    fn human_duration(duration: Duration, expected: &str) {
        assert_eq!(DisplayHumanDuration(duration).to_string(), expected);
    }

    #[test]
    fn plural_words() {
        assert_eq!(plural::tests_str(1), "test");
        assert_eq!(plural::tests_str(2), "tests");
        assert_eq!(plural::attempts_str(1), "attempt");
        assert_eq!(plural::attempts_str(5), "attempts");
    }
}
