//! Herald Tests - Integration and property tests for Herald.
//!
//! Everything runs against `SimulatedBroker`, optionally with injected
//! faults, so the tests need no external broker.
//!
//! ## Test Organization
//!
//! **Integration Tests** (`*_tests.rs`):
//! - `delivery_tests`: at-least-once delivery, ordering and commit safety
//! - `rebalance_tests`: group membership changes and assignment exclusivity
//! - `fault_tests`: broker outages and flaky requests, across seeds
//!
//! **Support Modules**:
//! - `properties`: property checkers (`check_assignment`, `check_ordering`, etc.)
//! - `scenarios`: reusable setups (producing, running consumers, seeds)
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;

#[cfg(test)]
mod delivery_tests;
#[cfg(test)]
mod rebalance_tests;
