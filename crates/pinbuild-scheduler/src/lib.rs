//! Pipeline scheduling for pinbuild.
//!
//! This crate sequences a parent component and the dependency it pins:
//! - Resolving the dependency pin from the parent's manifest
//! - Stamping release versions
//! - Fetching, building, installing and verifying components
//! - Reusing and populating the artifact cache

pub mod orchestrator;
pub mod release;
pub mod resolver;
pub mod stages;

#[cfg(test)]
mod testutil;

pub use orchestrator::{
    PipelineEvent, PipelineFailure, PipelineOrchestrator, PipelineResult, RunSummary,
};
pub use release::{StampOutcome, is_release, stamp_version};
pub use resolver::{RevisionResolver, parse_manifest};
