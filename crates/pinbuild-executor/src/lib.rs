//! Command execution backends for pinbuild.
//!
//! Provides executor implementations for running external tools:
//! - Local child processes

pub mod process;

pub use pinbuild_core::executor::{CommandExecutor, CommandOutput, CommandSpec};
pub use process::LocalProcessExecutor;
