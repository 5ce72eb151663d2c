//! Command Line Interface for the msak server
// (c) 2025 Ross Younger
mod args;
pub(crate) use args::CliArgs;
mod cli_main;
pub use cli_main::cli;
