//! Deterministic, pure logic shared by the control loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod abandonment;
pub mod attempt;
pub mod breaker;
pub mod commands;
pub mod danger;
pub mod outcome;
pub mod scope;
pub mod types;
