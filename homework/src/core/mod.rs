//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod artifacts;
pub mod budget;
pub mod decision;
pub mod entity;
pub mod plan;
pub mod status_block;
pub mod tools;
pub mod types;
