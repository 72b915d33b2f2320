//! Command line interface module
//!
//! Argument parsing and the runner that turns parsed arguments into a push
//! or list run.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
