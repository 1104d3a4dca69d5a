use super::Target;
use pinbuild_cache::find_files;
use pinbuild_core::executor::CommandExecutor;
use pinbuild_core::pipeline::{ParentSpec, TestReport};
use pinbuild_core::{BuildEnvironment, Error, Result};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs the test harness and collects its report.
pub struct VerificationStage {
    executor: Arc<dyn CommandExecutor>,
}

impl VerificationStage {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Run the configured test commands in the parent tree, then move the
    /// report they produced into `results_dir`.
    ///
    /// Test command failures are returned exactly as the executor reported
    /// them.
    pub async fn verify(
        &self,
        target: Target<'_>,
        parent: &ParentSpec,
        results_dir: &Path,
        env: &BuildEnvironment,
    ) -> Result<TestReport> {
        info!(component = %target.name(), "Running tests");
        let vars = target.variables(env);

        for command in &parent.test {
            self.executor
                .run_checked(target.shell(command, &vars, env))
                .await?;
        }

        let report_dir = target.dir.join(&parent.report.dir);
        let reports = find_files(&report_dir, &parent.report.extension, 2)?;
        let report = match reports.as_slice() {
            [] => {
                return Err(Error::pipeline(
                    format!("collecting {} test report", target.name()),
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!(
                            "no *.{} report under {}",
                            parent.report.extension,
                            report_dir.display()
                        ),
                    ),
                ));
            }
            [report] => report,
            [first, ..] => {
                warn!(count = reports.len(), report = %first.display(), "Several test reports found, keeping the first");
                first
            }
        };

        let file_name = report.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "report path has no file name")
        })?;
        fs::create_dir_all(results_dir)?;
        let destination = results_dir.join(file_name);
        move_file(report, &destination)?;

        info!(component = %target.name(), report = %destination.display(), "Tests passed");
        Ok(TestReport {
            component: target.name().to_string(),
            path: destination,
        })
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Results may live on another filesystem
    fs::copy(from, to)?;
    fs::remove_file(from)
}
