use pinbuild_core::executor::{CommandExecutor, CommandSpec};
use pinbuild_core::{BuildEnvironment, Error, RemoteRepository, Result, Revision};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const GIT: &str = "git";

/// Checks out component sources into the workspace.
pub struct SourceStage {
    executor: Arc<dyn CommandExecutor>,
    workspace: PathBuf,
}

impl SourceStage {
    pub fn new(executor: Arc<dyn CommandExecutor>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            workspace: workspace.into(),
        }
    }

    /// Checkout directory of a component.
    pub fn component_dir(&self, component: &str) -> PathBuf {
        self.workspace.join(component)
    }

    /// Bring `<workspace>/<component>` to `revision` from `remote`.
    ///
    /// Clones when the directory is missing, otherwise fetches (the branch
    /// when given), then hard-resets to the revision. Running it twice with
    /// the same arguments leaves the same tree.
    pub async fn fetch(
        &self,
        remote: &RemoteRepository,
        revision: &Revision,
        branch: Option<&str>,
        env: &BuildEnvironment,
    ) -> Result<PathBuf> {
        let component = revision.component();
        let dir = self.component_dir(component);

        if dir.is_dir() {
            info!(component, remote = %remote, "Fetching");
            let mut fetch = CommandSpec::new(GIT, &dir).args(["fetch", remote.url.as_str()]);
            if let Some(branch) = branch {
                fetch = fetch.arg(branch);
            }
            self.executor
                .run_checked(fetch.environment(env))
                .await
                .map_err(|e| Error::pipeline(format!("fetching {} from {}", component, remote), e))?;
        } else {
            info!(component, remote = %remote, "Cloning");
            std::fs::create_dir_all(&self.workspace)?;
            let clone = CommandSpec::new(GIT, &self.workspace)
                .args(["clone", remote.url.as_str(), component])
                .environment(env);
            self.executor
                .run_checked(clone)
                .await
                .map_err(|e| Error::pipeline(format!("cloning {} from {}", component, remote), e))?;
        }

        let reset = CommandSpec::new(GIT, &dir)
            .args(["reset", "--hard", revision.hash()])
            .environment(env);
        match self.executor.run_checked(reset).await {
            Ok(_) => {}
            Err(Error::CommandFailed { diagnostic, .. }) => {
                return Err(Error::RevisionNotFound {
                    component: component.to_string(),
                    revision: revision.hash().to_string(),
                    message: diagnostic,
                });
            }
            Err(e) => {
                return Err(Error::pipeline(
                    format!("resetting {} to {}", component, revision.short_hash()),
                    e,
                ));
            }
        }

        debug!(component, revision = %revision.hash(), dir = %dir.display(), "Source ready");
        Ok(dir)
    }
}
