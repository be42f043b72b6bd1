//! Resumable, queue-driven homework run engine.
//!
//! A run pursues one free-text objective through a sequence of bounded
//! iterations. Each iteration is one job delivery: a planner call, its tool
//! calls, and up to three concurrent executor sub-agents, all recorded in a
//! per-run workspace. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stop decisions, budgets, plan
//!   identity, status normalization, tool-call parsing). No I/O.
//! - **[`io`]**: Side-effecting adapters (datastore, job queue, notifications,
//!   prompt rendering, the `codex exec` completion backend).
//!
//! Orchestration modules ([`controller`], [`iteration`], [`worker`], [`submit`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod agents;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod submit;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod worker;
pub mod workspace;
