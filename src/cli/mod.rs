//! Command-line interface for webeval.
//!
//! Provides the `run` command (execute an evaluation batch) and the
//! `judge` command (re-judge a saved task folder).

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
