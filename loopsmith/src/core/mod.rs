//! Deterministic, pure logic shared by the loop core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod envelope;
pub mod invariants;
pub mod judge;
pub mod selector;
pub mod task;
pub mod types;
