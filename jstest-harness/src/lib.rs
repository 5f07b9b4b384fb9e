// Copyright (c) The jstest-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A conformance harness for database-shell test corpora.
//!
//! For documentation and usage, run `jstest-harness --help`.

mod dispatch;
mod errors;
mod output;

pub use dispatch::JstestApp;
pub use errors::ExpectedError;
