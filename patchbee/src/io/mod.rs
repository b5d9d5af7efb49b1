//! Side-effecting adapters: filesystem, git, child processes and HTTP.

pub mod accumulator;
pub mod apply;
pub mod backend;
pub mod config;
pub mod decoder;
pub mod files;
pub mod git;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod verify;
