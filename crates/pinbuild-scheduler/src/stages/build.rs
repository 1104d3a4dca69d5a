use super::Target;
use pinbuild_cache::copy::remove_if_present;
use pinbuild_cache::{find_files, newest_file};
use pinbuild_core::executor::{CommandExecutor, CommandSpec};
use pinbuild_core::pipeline::{BuildOutput, ParentSpec};
use pinbuild_core::{BuildEnvironment, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-call switches for [`BuildStage::build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions<'a> {
    /// Hard-reset the tree to the target revision first.
    pub reset: bool,
    /// Subdirectory dependents link against.
    pub output_dir: Option<&'a Path>,
    /// File touched in the tree once the build succeeds.
    pub marker: Option<&'a Path>,
}

/// Compiles and packages a component with its configured commands.
pub struct BuildStage {
    executor: Arc<dyn CommandExecutor>,
    ci: bool,
}

impl BuildStage {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            ci: false,
        }
    }

    /// Also run `ci-package` commands after packaging.
    pub fn with_ci(mut self, ci: bool) -> Self {
        self.ci = ci;
        self
    }

    /// Build a component tree.
    ///
    /// A failing external command becomes [`Error::ComponentBuildFailed`];
    /// anything else is wrapped as a pipeline error.
    pub async fn build(
        &self,
        target: Target<'_>,
        options: BuildOptions<'_>,
        env: &BuildEnvironment,
    ) -> Result<BuildOutput> {
        info!(component = %target.name(), revision = %target.revision.short_hash(), "Building");
        env.log_diagnostics(target.name());

        self.run_build(target, options, env)
            .await
            .map_err(|e| classify(target.name(), e))?;

        let output_path = match options.output_dir {
            Some(dir) => target.dir.join(dir),
            None => target.dir.to_path_buf(),
        };
        info!(component = %target.name(), output = %output_path.display(), "Build succeeded");

        Ok(BuildOutput {
            component: target.name().to_string(),
            root: target.dir.to_path_buf(),
            output_path,
        })
    }

    async fn run_build(
        &self,
        target: Target<'_>,
        options: BuildOptions<'_>,
        env: &BuildEnvironment,
    ) -> Result<()> {
        if options.reset {
            let reset = CommandSpec::new("git", target.dir)
                .args(["reset", "--hard", target.revision.hash()])
                .environment(env);
            self.executor.run_checked(reset).await?;
        }

        for path in target.spec.clean.iter().chain(&target.spec.exclude) {
            if remove_if_present(target.dir, path)? {
                debug!(component = %target.name(), path = %path.display(), "Removed");
            }
        }

        let vars = target.variables(env);
        let mut commands: Vec<&String> = target
            .spec
            .build
            .iter()
            .chain(&target.spec.package)
            .collect();
        if self.ci {
            commands.extend(&target.spec.ci_package);
        }

        for command in commands {
            self.executor
                .run_checked(target.shell(command, &vars, env))
                .await?;
        }

        if let Some(marker) = options.marker {
            std::fs::write(target.dir.join(marker), "")?;
        }
        Ok(())
    }

    /// Install the package the parent build produced.
    ///
    /// Returns the installed package file. Its path is bound to
    /// `${package}` in the install commands.
    pub async fn install(
        &self,
        target: Target<'_>,
        parent: &ParentSpec,
        env: &BuildEnvironment,
    ) -> Result<PathBuf> {
        let package = locate_package(target, parent).map_err(|e| classify(target.name(), e))?;
        info!(component = %target.name(), package = %package.display(), "Installing package");

        let mut vars = target.variables(env);
        vars.set("package", package.to_string_lossy());

        for command in &parent.install {
            self.executor
                .run_checked(target.shell(command, &vars, env))
                .await
                .map_err(|e| classify(target.name(), e))?;
        }
        Ok(package)
    }
}

fn locate_package(target: Target<'_>, parent: &ParentSpec) -> Result<PathBuf> {
    let dir = target.dir.join(&parent.package.dir);
    let files = find_files(&dir, &parent.package.extension, 1)?;
    if files.len() > 1 {
        warn!(dir = %dir.display(), count = files.len(), "Several packages found, installing the newest");
    }
    newest_file(&files)?.ok_or_else(|| Error::ComponentBuildFailed {
        component: target.name().to_string(),
        message: format!(
            "no *.{} package produced in {}",
            parent.package.extension,
            dir.display()
        ),
    })
}

fn classify(component: &str, err: Error) -> Error {
    match err {
        Error::CommandFailed { .. } => Error::ComponentBuildFailed {
            component: component.to_string(),
            message: err.to_string(),
        },
        Error::ComponentBuildFailed { .. } => err,
        other => Error::pipeline(format!("building {}", component), other),
    }
}
