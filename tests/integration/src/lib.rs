//! End-to-end tests for the fleetloop dispatcher
//!
//! This suite validates:
//! - The documented truck scenarios over real TCP sessions
//! - Gate serialization between concurrently arriving trucks
//! - Dispenser signal idempotence across the router
//! - Mission binding invariants under concurrent requests
//! - Mission reconciliation after a restart

pub mod test_utils;

#[cfg(test)]
mod scenario_tests;

#[cfg(test)]
mod concurrency_tests;

#[cfg(test)]
mod restart_tests;
