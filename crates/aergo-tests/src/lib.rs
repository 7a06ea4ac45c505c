//! # aergo-tests
//!
//! Integration tests for the Aergo P2P core.
//!
//! This crate provides:
//! - A harness with an in-memory chain, a recording actor and loopback nodes
//! - Property-based tests for framing, reconnect backoff and certificates
//! - End-to-end scenarios over duplex streams and real sockets

pub mod harness;

#[cfg(test)]
mod property_tests;

#[cfg(test)]
mod scenario_tests;

pub use harness::*;
