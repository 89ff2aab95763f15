//! Domain model for ioflow
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{
    ns_to_us, ns_to_us_f64, BioKind, Direction, Handle, ObjectHandle, Pid, SequenceNumber,
    ThreadHandle, Token,
};

pub use errors::{AttachError, ConfigError, CorrelationGap, DecodeError, KeystoreError};
