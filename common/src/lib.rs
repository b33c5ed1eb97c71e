//! Provides types and functions common to the stampede binaries.
#![deny(missing_docs)]
pub mod telemetry;
