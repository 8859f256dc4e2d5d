//! Output formatting module
//!
//! Provides various output formats for run state.

mod formatter;

pub use formatter::{OutputFormat, ResultFormatter};
