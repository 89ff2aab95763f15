//! Command-line interface for ioflow
//!
//! This module contains CLI argument parsing and configuration

pub mod args;

pub use args::{Args, Command, TraceArgs};
