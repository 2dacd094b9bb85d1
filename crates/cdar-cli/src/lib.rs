//! cdar command line: argument parsing, settings files and subcommand dispatch

pub mod cli;
pub mod config;

pub use cli::{Cli, Command};
pub use config::CdarConfig;
