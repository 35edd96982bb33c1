//! Sluice Core
//!
//! Core types and abstractions for the Sluice pipeline runner.
//!
//! This crate contains:
//! - Environment: ordered variables with public/hidden pass-through and interpolation
//! - Step and pipeline definitions as handed to a runner
//! - Lifecycle events emitted while a pipeline runs
//!
//! Nothing in here performs I/O against containers; execution lives in the runner.

pub mod environment;
pub mod event;
pub mod pipeline;
pub mod step;

pub use environment::Environment;
