//! Correlation state: identity keystores and the sequence correlator

pub mod keystore;
pub mod sequence;

pub use keystore::{Entry, Keystore, Stage, StageTimestamps, Stamped, TokenAllocator};
pub use sequence::SequenceCorrelator;
