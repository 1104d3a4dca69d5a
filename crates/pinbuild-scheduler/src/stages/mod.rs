//! Pipeline stages.
//!
//! Each stage drives external tools through a [`CommandExecutor`] and
//! receives the build environment explicitly.
//!
//! [`CommandExecutor`]: pinbuild_core::executor::CommandExecutor

mod build;
mod source;
mod verify;

pub use build::{BuildOptions, BuildStage};
pub use source::SourceStage;
pub use verify::VerificationStage;

use pinbuild_config::{VariableContext, VariableContextBuilder};
use pinbuild_core::executor::CommandSpec;
use pinbuild_core::pipeline::ComponentSpec;
use pinbuild_core::{BuildEnvironment, Revision};
use std::path::Path;

/// A component tree a stage operates on.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub spec: &'a ComponentSpec,
    pub dir: &'a Path,
    pub revision: &'a Revision,
    pub branch: Option<&'a str>,
}

impl Target<'_> {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Interpolation context for this component's command strings.
    pub fn variables(&self, env: &BuildEnvironment) -> VariableContext {
        let mut builder = VariableContextBuilder::new()
            .with_git_sha(self.revision.hash())
            .with_component(self.name(), self.dir)
            .with_environment(env);
        if let Some(branch) = self.branch {
            builder = builder.with_git_branch(branch);
        }
        builder.build()
    }

    /// A configured command string, run in the component tree.
    pub fn shell(
        &self,
        command: &str,
        vars: &VariableContext,
        env: &BuildEnvironment,
    ) -> CommandSpec {
        CommandSpec::shell(vars.interpolate_shell(command), self.dir).environment(env)
    }
}
