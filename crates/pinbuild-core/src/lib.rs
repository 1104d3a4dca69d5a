//! Core domain types and traits for pinbuild.
//!
//! This crate contains:
//! - Revisions, remotes and dependency pins
//! - The build environment threaded through external invocations
//! - The command executor trait used for every external tool
//! - Pipeline definitions and orchestration states
//! - The error taxonomy shared by every stage

pub mod environment;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod revision;

pub use environment::BuildEnvironment;
pub use error::{Error, Result};
pub use id::RunId;
pub use revision::{DependencyPin, RemoteRepository, Revision};
