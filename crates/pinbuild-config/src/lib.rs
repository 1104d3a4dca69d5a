//! KDL configuration parsing for pinbuild.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (pinbuild.kdl)
//! - Variable interpolation in command strings

pub mod error;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use variables::{ComponentContext, GitContext, VariableContext, VariableContextBuilder};
