//! Property-based tests for the CESS storage miner.
//!
//! This crate contains proptest-based property tests for the invariants the
//! proof engine relies on across crates.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all property tests
//! cargo test -p proptests
//!
//! # Run with more test cases (slower but more thorough)
//! PROPTEST_CASES=10000 cargo test -p proptests
//!
//! # Run specific test module
//! cargo test -p proptests ranges
//! ```
//!
//! ## Test Categories
//!
//! - **Accumulator tests**: prover status ordering across commits and deletions
//! - **Range tests**: challenge-handle partitioning of the committed window
//! - **Sigma tests**: order independence of service proof aggregation
//! - **Record tests**: stale proof records are discarded, never resumed

pub use common;

/// Shared test strategies and helpers.
pub mod strategies;

#[cfg(test)]
mod accumulator;
#[cfg(test)]
mod ranges;
#[cfg(test)]
mod records;
#[cfg(test)]
mod sigma;
