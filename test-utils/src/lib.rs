//! Shared test utilities for retail-resilience.
//!
//! This crate provides:
//! - Proptest generators for domain inputs
//! - Mock implementations of the injected seams
//! - Fixtures with sample failure messages and payloads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use generators::*;
