//! Structured error types for ioflow
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;
use thiserror::Error;

/// Identity keystore failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreError {
    /// No live entry for the handle (an earlier stage never fired or was
    /// already closed)
    #[error("{scope}: no live entry for handle {handle:#x}")]
    NotFound { scope: &'static str, handle: u64 },
}

/// A stage that could not be correlated: counted, traced, never fatal
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationGap {
    #[error(transparent)]
    Missing(#[from] KeystoreError),

    /// A closing stage fired before the stage that opens it
    #[error("{scope}: {stage} out of order for handle {handle:#x}")]
    OutOfOrder { scope: &'static str, stage: &'static str, handle: u64 },
}

/// Malformed configuration, reported before any probe is loaded
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid threshold '{0}': expected a finite, non-negative number of milliseconds")]
    InvalidThreshold(String),

    #[error("Invalid transport capacity: {0} (must be at least 1)")]
    InvalidCapacity(usize),

    #[error("Failed to read layout file {path}: {source}")]
    LayoutRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse layout file {path}: {source}")]
    LayoutParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Ring buffer record that cannot be decoded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Short stage record: expected {expected} bytes, got {actual}")]
    ShortRecord { expected: usize, actual: usize },

    #[error("Unknown stage code: {0}")]
    UnknownStage(u32),

    #[error("Unknown merge kind: {0}")]
    UnknownMergeKind(u32),

    #[error("Unknown bio record kind: {0}")]
    UnknownBioKind(u8),
}

/// Instrumentation attachment failures
#[derive(Error, Debug)]
pub enum AttachError {
    /// None of the candidate hook names exist on the running kernel
    #[error("No hook available for {program} (tried: {candidates})")]
    HookNotFound { program: &'static str, candidates: String },

    #[error("eBPF program {0} not found in object")]
    ProgramNotFound(&'static str),

    #[error("Failed to attach {program} to {hook}: {error}")]
    AttachFailed { program: &'static str, hook: String, error: String },

    #[error("Failed to read /proc/kallsyms: {0}")]
    Kallsyms(#[source] std::io::Error),
}
