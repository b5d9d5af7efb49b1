//! Deterministic, pure logic shared by the workflow.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod containment;
pub mod context;
pub mod fence;
pub mod scrub;
pub mod types;
