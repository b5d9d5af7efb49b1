//! Test-driven code modification agent.
//!
//! patchbee gathers a project's source text, asks a generative model for a
//! change, applies it and runs a verification command, retrying with the
//! failure as feedback until the command passes or the attempt budget runs
//! out. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (comment scrubbing, fence
//!   stripping, path containment, shared types). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, HTTP, process
//!   execution). The backend and verifier sit behind traits so tests can
//!   script them.
//!
//! Orchestration modules ([`workflow`], [`assist`]) compose the two to
//! implement CLI commands.

pub mod assist;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
