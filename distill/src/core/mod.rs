//! Deterministic, pure logic for the supervisor-worker loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod chunking;
pub mod extract;
pub mod features;
pub mod nudge;
pub mod output;
pub mod types;
