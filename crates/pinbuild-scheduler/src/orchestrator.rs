//! Pipeline orchestrator - drives both components through the state machine.

use crate::release::{is_release, stamp_version};
use crate::resolver::RevisionResolver;
use crate::stages::{BuildOptions, BuildStage, SourceStage, Target, VerificationStage};
use chrono::{DateTime, Utc};
use pinbuild_cache::{ArtifactCache, PackageRecord, PackageRequest, PublishOptions, PublishOutcome};
use pinbuild_core::executor::CommandExecutor;
use pinbuild_core::pipeline::{PipelineDefinition, PipelineState, RunRequest, RunSettings, TestReport};
use pinbuild_core::revision::provided;
use pinbuild_core::{BuildEnvironment, DependencyPin, Error, RemoteRepository, Result, Revision, RunId};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    StateEntered { state: PipelineState },
    StateCompleted { state: PipelineState },
    PipelineCompleted { success: bool },
}

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: String,
    pub parent: Revision,
    pub dependency: DependencyPin,
    pub release: bool,
    pub dependency_cache_hit: bool,
    /// Tree the parent was built against.
    pub dependency_dir: PathBuf,
    pub package: Option<PathBuf>,
    pub package_record: Option<PackageRecord>,
    pub report: Option<TestReport>,
    pub states: Vec<PipelineState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A run that stopped in `stage`.
#[derive(Debug, thiserror::Error)]
#[error("pipeline failed in {stage}: {source}")]
pub struct PipelineFailure {
    pub run_id: RunId,
    pub stage: PipelineState,
    /// States that finished before the failure.
    pub completed: Vec<PipelineState>,
    pub source: Error,
}

/// Result of a pipeline execution.
pub type PipelineResult = std::result::Result<RunSummary, PipelineFailure>;

/// Mutable state of one run.
struct RunContext {
    request: RunRequest,
    parent: Revision,
    parent_remote: RemoteRepository,
    parent_dir: PathBuf,
    env: BuildEnvironment,
    release: bool,
    pin: Option<DependencyPin>,
    dependency_dir: PathBuf,
    /// Directory the parent links against, from the build or the cache.
    dependency_output: Option<PathBuf>,
    cache_hit: bool,
    package: Option<PathBuf>,
    package_record: Option<PackageRecord>,
    report: Option<TestReport>,
}

impl RunContext {
    fn pin(&self) -> Result<DependencyPin> {
        self.pin
            .clone()
            .ok_or_else(|| Error::InvalidInput("dependency pin has not been resolved".to_string()))
    }
}

/// Orchestrates one parent/dependency pipeline.
///
/// Runs are strictly sequential: every state awaits its external commands
/// before the next one starts, and the first failure ends the run.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    executor: Arc<dyn CommandExecutor>,
    definition: Arc<PipelineDefinition>,
    settings: RunSettings,
    cache: ArtifactCache,
    base_env: BuildEnvironment,
}

impl PipelineOrchestrator {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        definition: PipelineDefinition,
        settings: RunSettings,
    ) -> Self {
        let cache = ArtifactCache::new(&settings.cache_root);
        Self {
            executor,
            definition: Arc::new(definition),
            settings,
            cache,
            base_env: BuildEnvironment::new(),
        }
    }

    /// Seed every run's build environment, e.g. with the process environment.
    pub fn with_base_environment(mut self, env: BuildEnvironment) -> Self {
        self.base_env = env;
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Execute a run, returning a channel of events and a handle to get the final result.
    pub fn execute(
        &self,
        request: RunRequest,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let orchestrator = self.clone();

        let handle = tokio::spawn(async move { orchestrator.run_inner(request, Some(tx)).await });

        (rx, handle)
    }

    /// Execute a run without reporting events.
    pub async fn run(&self, request: RunRequest) -> PipelineResult {
        self.run_inner(request, None).await
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        events: Option<mpsc::Sender<PipelineEvent>>,
    ) -> PipelineResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let def = &self.definition;

        let parent = Revision::new(&def.parent.component.name, request.parent_revision.trim());
        let parent_remote = RemoteRepository::new(&def.parent.component.name, &request.parent_remote);
        let parent_dir = request.workspace.join(&def.parent.component.name);
        let dependency_dir = request.workspace.join(&def.dependency.component.name);

        let mut env = self.base_env.clone();
        env.extend(def.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        info!(
            run_id = %run_id.short(),
            pipeline = %def.name,
            revision = %parent.hash(),
            branch = %request.parent_branch,
            "Starting pipeline run"
        );

        let mut run = RunContext {
            request,
            parent,
            parent_remote,
            parent_dir,
            env,
            release: false,
            pin: None,
            dependency_dir,
            dependency_output: None,
            cache_hit: false,
            package: None,
            package_record: None,
            report: None,
        };

        let mut completed = Vec::new();
        let mut state = PipelineState::ResolveParentRevision;

        while !state.is_terminal() {
            emit(&events, PipelineEvent::StateEntered { state }).await;
            debug!(state = %state, "Entering state");

            match self.step(state, &mut run).await {
                Ok(next) => {
                    emit(&events, PipelineEvent::StateCompleted { state }).await;
                    completed.push(state);
                    state = next;
                }
                Err(source) => {
                    error!(run_id = %run_id.short(), state = %state, kind = source.kind(), error = %source, "Pipeline failed");
                    emit(&events, PipelineEvent::PipelineCompleted { success: false }).await;
                    return Err(PipelineFailure {
                        run_id,
                        stage: state,
                        completed,
                        source,
                    });
                }
            }
        }

        emit(&events, PipelineEvent::PipelineCompleted { success: true }).await;
        info!(run_id = %run_id.short(), cache_hit = run.cache_hit, "Pipeline completed");

        let dependency = match run.pin() {
            Ok(pin) => pin,
            Err(source) => {
                return Err(PipelineFailure {
                    run_id,
                    stage: state,
                    completed,
                    source,
                });
            }
        };
        Ok(RunSummary {
            run_id,
            pipeline: def.name.clone(),
            parent: run.parent,
            dependency,
            release: run.release,
            dependency_cache_hit: run.cache_hit,
            dependency_dir: run.dependency_dir,
            package: run.package,
            package_record: run.package_record,
            report: run.report,
            states: completed,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run one state and return the next one.
    async fn step(&self, state: PipelineState, run: &mut RunContext) -> Result<PipelineState> {
        use PipelineState::*;

        let def = &self.definition;
        let source = SourceStage::new(self.executor.clone(), &run.request.workspace);
        let builder = BuildStage::new(self.executor.clone()).with_ci(self.settings.ci);

        match state {
            ResolveParentRevision => {
                if provided(Some(run.parent.hash())).is_none() {
                    return Err(Error::InvalidInput("parent revision is required".to_string()));
                }
                if provided(Some(run.parent_remote.url.as_str())).is_none() {
                    return Err(Error::InvalidInput("parent remote is required".to_string()));
                }
                self.cache
                    .entry_path(run.parent.component(), run.parent.hash())?;
                self.prepare_outputs(&run.request.workspace)?;

                run.parent_dir = source
                    .fetch(
                        &run.parent_remote,
                        &run.parent,
                        Some(run.request.parent_branch.as_str()),
                        &run.env,
                    )
                    .await?;
                run.env
                    .set_path(&def.parent.component.dir_var, &run.parent_dir);
                Ok(StampVersionIfRelease)
            }

            StampVersionIfRelease => {
                run.release = is_release(&run.request.parent_branch, run.parent.hash());
                if run.release {
                    let outcome = stamp_version(
                        &run.parent_dir,
                        &def.parent.version_file,
                        &def.parent.stamp_files,
                        run.parent.hash(),
                    )?;
                    info!(files = outcome.stamped.len(), "Release version stamped");
                } else {
                    debug!(branch = %run.request.parent_branch, "Not a release build");
                }
                Ok(ResolveDependencyPin)
            }

            ResolveDependencyPin => {
                let resolver = RevisionResolver::new(
                    &def.dependency.component.name,
                    def.parent.manifest.clone(),
                );
                let pin = resolver.resolve(
                    &run.parent_dir,
                    run.request.dependency_remote.as_deref(),
                    run.request.dependency_revision.as_deref(),
                )?;
                self.cache
                    .entry_path(pin.revision.component(), pin.revision.hash())?;
                info!(
                    dependency = %pin.revision.component(),
                    revision = %pin.revision.hash(),
                    remote = %pin.remote,
                    "Dependency pinned"
                );
                run.pin = Some(pin);
                Ok(CheckDependencyCache)
            }

            CheckDependencyCache => {
                let pin = run.pin()?;
                let component = pin.revision.component();
                let entry = self.cache.entry_path(component, pin.revision.hash())?;
                if self.cache.exists(component, pin.revision.hash()) {
                    info!(dependency = %component, path = %entry.display(), "Found cached dependency");
                    run.cache_hit = true;
                    run.dependency_output = Some(match &def.dependency.output_dir {
                        Some(dir) => entry.join(dir),
                        None => entry.clone(),
                    });
                    run.dependency_dir = entry;
                    Ok(SkipDependencyBuild)
                } else {
                    info!(dependency = %component, revision = %pin.revision.short_hash(), "Dependency not cached, building from source");
                    Ok(FetchDependency)
                }
            }

            FetchDependency => {
                let pin = run.pin()?;
                run.dependency_dir = source
                    .fetch(&pin.remote, &pin.revision, None, &run.env)
                    .await?;
                Ok(BuildDependency)
            }

            BuildDependency => {
                let pin = run.pin()?;
                let target = Target {
                    spec: &def.dependency.component,
                    dir: &run.dependency_dir,
                    revision: &pin.revision,
                    branch: None,
                };
                let options = BuildOptions {
                    reset: true,
                    output_dir: def.dependency.output_dir.as_deref(),
                    marker: None,
                };
                let output = builder.build(target, options, &run.env).await?;
                run.dependency_output = Some(output.output_path);
                Ok(RegisterDependencyEnvironment)
            }

            SkipDependencyBuild => {
                debug!("Skipping dependency fetch and build");
                Ok(RegisterDependencyEnvironment)
            }

            RegisterDependencyEnvironment => {
                let dependency = &def.dependency;
                run.env
                    .set_path(&dependency.component.dir_var, &run.dependency_dir);
                if let (Some(var), Some(output)) = (&dependency.output_var, &run.dependency_output) {
                    run.env.set_path(var, output);
                }
                debug!(var = %dependency.component.dir_var, path = %run.dependency_dir.display(), "Registered dependency");
                Ok(BuildParent)
            }

            BuildParent => {
                let target = Target {
                    spec: &def.parent.component,
                    dir: &run.parent_dir,
                    revision: &run.parent,
                    branch: Some(run.request.parent_branch.as_str()),
                };
                let options = BuildOptions {
                    // Resetting here would undo release stamping
                    reset: false,
                    output_dir: None,
                    marker: def.parent.marker.as_deref(),
                };
                builder.build(target, options, &run.env).await?;
                Ok(InstallParentPackage)
            }

            InstallParentPackage => {
                if def.parent.install.is_empty() {
                    debug!("No install commands configured");
                } else {
                    let target = Target {
                        spec: &def.parent.component,
                        dir: &run.parent_dir,
                        revision: &run.parent,
                        branch: Some(run.request.parent_branch.as_str()),
                    };
                    let package = builder.install(target, &def.parent, &run.env).await?;
                    run.package = Some(package);
                }
                Ok(RunVerification)
            }

            RunVerification => {
                let target = Target {
                    spec: &def.parent.component,
                    dir: &run.parent_dir,
                    revision: &run.parent,
                    branch: Some(run.request.parent_branch.as_str()),
                };
                let report = VerificationStage::new(self.executor.clone())
                    .verify(target, &def.parent, &self.settings.results_dir, &run.env)
                    .await?;
                run.report = Some(report);
                Ok(PublishParentToCache)
            }

            PublishParentToCache => {
                let options = PublishOptions {
                    exclude: def.parent.component.exclude.clone(),
                    package: Some(PackageRequest {
                        dir: def.parent.package.dir.clone(),
                        extension: def.parent.package.extension.clone(),
                        artifacts_dir: self.settings.artifacts_dir.clone(),
                    }),
                };
                let outcome = self
                    .publish(run.parent.clone(), run.parent_dir.clone(), options)
                    .await?;
                if let PublishOutcome::Published { package, .. } = outcome {
                    run.package_record = package;
                }
                Ok(PublishDependencyToCache)
            }

            PublishDependencyToCache => {
                let pin = run.pin()?;
                if run.cache_hit {
                    debug!(dependency = %pin.revision.component(), "Dependency came from the cache");
                } else {
                    let options = PublishOptions {
                        exclude: def.dependency.component.exclude.clone(),
                        package: None,
                    };
                    self.publish(pin.revision, run.dependency_dir.clone(), options)
                        .await?;
                }
                Ok(Done)
            }

            Done => Ok(Done),
        }
    }

    /// Copy a tree into the cache off the async runtime.
    async fn publish(
        &self,
        revision: Revision,
        dir: PathBuf,
        options: PublishOptions,
    ) -> Result<PublishOutcome> {
        let cache = self.cache.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            cache.publish(revision.component(), revision.hash(), &dir, &options)
        })
        .await
        .map_err(|e| Error::pipeline("cache publish task failed", e))??;

        if let PublishOutcome::AlreadyPresent(entry) = &outcome {
            info!(component = %entry.component, revision = %entry.revision, "Already cached, keeping existing entry");
        }
        Ok(outcome)
    }

    /// Create or empty the per-run output directories.
    ///
    /// Both are checked before anything is removed: an output directory may
    /// not overlap the cache root or contain the workspace.
    fn prepare_outputs(&self, workspace: &Path) -> Result<()> {
        let outputs = [&self.settings.artifacts_dir, &self.settings.results_dir];
        let cache_root = resolved(&self.settings.cache_root);
        let workspace = resolved(workspace);

        for dir in outputs {
            let out = resolved(dir);
            if out.starts_with(&cache_root) || cache_root.starts_with(&out) {
                return Err(Error::InvalidInput(format!(
                    "output directory {} overlaps the cache root {}",
                    dir.display(),
                    self.settings.cache_root.display()
                )));
            }
            if workspace.starts_with(&out) {
                return Err(Error::InvalidInput(format!(
                    "output directory {} contains the workspace",
                    dir.display()
                )));
            }
        }

        for dir in outputs {
            reset_dir(dir)?;
        }
        Ok(())
    }
}

/// Absolute form of `path` with its deepest existing ancestor canonicalized.
fn resolved(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        warn!(dir = %dir.display(), "Replacing previous run output");
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

async fn emit(events: &Option<mpsc::Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingExecutor;
    use pinbuild_config::parse_pipeline;
    use std::fs;
    use tempfile::TempDir;

    const APP_URL: &str = "git://example.com/app.git";
    const CORE_URL: &str = "git://example.com/core.git";

    const PIPELINE: &str = r#"
        pipeline "app"

        env {
            PYTHONUNBUFFERED "1"
        }

        dependency "core" {
            dir-var "CORE_DIR"
            output-dir "build/release"
            output-var "CORE_RELEASE"
            clean "build"
            exclude "external/linux32arm"
            build {
                run "build-core"
            }
            package {
                run "package-core"
            }
            ci-package {
                run "upload-core"
            }
        }

        parent "app" {
            dir-var "APP_DIR"
            manifest ".app_modules" remote-key="CORE_REMOTE" revision-key="CORE_COMMITISH"
            version-file "VERSION"
            stamp "VERSION" "app/__init__.py"
            clean "build"
            dist "dist" extension="whl"
            marker "app.stamp"
            build {
                run "build-app --core=${env.CORE_RELEASE}"
            }
            install {
                run "install-app ${package}"
            }
            test {
                run "smoke-test"
                run "run-tests"
            }
            report "tests/results/xunit" extension="xml"
        }
    "#;

    struct Fixture {
        _temp: TempDir,
        workspace: PathBuf,
        settings: RunSettings,
        definition: PipelineDefinition,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let workspace = temp.path().join("workspace");
            let settings = RunSettings::new(temp.path().join("cache"), temp.path().join("out"));
            Self {
                workspace,
                settings,
                definition: parse_pipeline(PIPELINE).unwrap(),
                _temp: temp,
            }
        }

        fn request(&self, branch: &str, revision: &str) -> RunRequest {
            RunRequest {
                workspace: self.workspace.clone(),
                parent_remote: APP_URL.to_string(),
                parent_branch: branch.to_string(),
                parent_revision: revision.to_string(),
                dependency_remote: None,
                dependency_revision: None,
            }
        }

        fn orchestrator(&self, executor: Arc<RecordingExecutor>) -> PipelineOrchestrator {
            PipelineOrchestrator::new(executor, self.definition.clone(), self.settings.clone())
        }

        fn cache(&self) -> ArtifactCache {
            ArtifactCache::new(&self.settings.cache_root)
        }
    }

    fn app_files() -> Vec<(&'static str, &'static str)> {
        vec![
            (
                ".app_modules",
                "CORE_REMOTE = 'git://example.com/core.git'\nCORE_COMMITISH = 'd1'\n",
            ),
            ("VERSION", "0.9.0-dev\n"),
            ("app/__init__.py", "__version__ = \"0.9.0-dev\"\n"),
            ("setup.py", "setup()"),
        ]
    }

    fn executor_with(app_files: &[(&str, &str)]) -> RecordingExecutor {
        RecordingExecutor::new()
            .with_remote(APP_URL, app_files, &["p1", "1.2.3"])
            .with_remote(
                CORE_URL,
                &[
                    ("CMakeLists.txt", "project(core)"),
                    ("external/linux32arm/libarm.a", "arm"),
                ],
                &["d1", "d2"],
            )
            .on_command("build-core", &[("build/release/lib/libcore.a", "lib")])
            .on_command("build-app", &[("dist/app-0.9.0-py2-none-any.whl", "whl")])
            .on_command(
                "run-tests",
                &[("tests/results/xunit/py2/results.xml", "<testsuite/>")],
            )
    }

    fn executor() -> RecordingExecutor {
        executor_with(&app_files())
    }

    /// Commands that touched the dependency checkout or its remote.
    fn dependency_commands(executor: &RecordingExecutor, workspace: &Path) -> usize {
        let core_dir = workspace.join("core");
        executor
            .calls()
            .iter()
            .filter(|c| c.working_dir == core_dir || c.args.iter().any(|a| a == CORE_URL))
            .count()
    }

    #[tokio::test]
    async fn test_cold_cache_builds_dependency_then_parent() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());

        let summary = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert!(!summary.dependency_cache_hit);
        assert_eq!(summary.dependency.revision.hash(), "d1");
        assert_eq!(summary.dependency.remote.url, CORE_URL);
        assert_eq!(executor.count(&format!("git clone {}", CORE_URL)), 1);
        assert_eq!(executor.count("build-core"), 1);

        // Dependency is fetched and built before the parent
        let clone_core = executor.position(&format!("git clone {}", CORE_URL)).unwrap();
        let build_core = executor.position("build-core").unwrap();
        let build_app = executor.position("build-app").unwrap();
        let tests = executor.position("run-tests").unwrap();
        assert!(clone_core < build_core && build_core < build_app && build_app < tests);

        let cache = fx.cache();
        assert!(cache.exists("core", "d1"));
        assert!(cache.exists("app", "p1"));
        let core_entry = cache.entry_path("core", "d1").unwrap();
        assert!(core_entry.join("build/release/lib/libcore.a").exists());
        assert!(!core_entry.join("external/linux32arm").exists());
        assert!(cache.entry_path("app", "p1").unwrap().join("app.stamp").exists());

        assert_eq!(
            fs::read_to_string(fx.settings.artifacts_dir.join("app-package-version.txt")).unwrap(),
            "p1:app-0.9.0-py2-none-any.whl"
        );
        assert_eq!(
            fs::read_to_string(fx.settings.artifacts_dir.join("app-sha.txt")).unwrap(),
            "p1"
        );
        assert!(fx.settings.results_dir.join("results.xml").exists());

        assert_eq!(
            summary.states,
            vec![
                PipelineState::ResolveParentRevision,
                PipelineState::StampVersionIfRelease,
                PipelineState::ResolveDependencyPin,
                PipelineState::CheckDependencyCache,
                PipelineState::FetchDependency,
                PipelineState::BuildDependency,
                PipelineState::RegisterDependencyEnvironment,
                PipelineState::BuildParent,
                PipelineState::InstallParentPackage,
                PipelineState::RunVerification,
                PipelineState::PublishParentToCache,
                PipelineState::PublishDependencyToCache,
            ]
        );
    }

    #[tokio::test]
    async fn test_parent_sees_dependency_environment() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());

        fx.orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        let calls = executor.calls();
        let build_app = calls
            .iter()
            .find(|c| c.display().starts_with("build-app"))
            .unwrap();
        let core_release = fx.workspace.join("core/build/release");
        assert_eq!(
            build_app.display(),
            format!("build-app --core={}", core_release.display())
        );
        assert_eq!(
            build_app.env.get("CORE_RELEASE").map(String::as_str),
            Some(core_release.to_str().unwrap())
        );
        assert_eq!(
            build_app.env.get("APP_DIR").map(PathBuf::from),
            Some(fx.workspace.join("app"))
        );
        assert_eq!(
            build_app.env.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );

        let install = calls
            .iter()
            .find(|c| c.display().starts_with("install-app"))
            .unwrap();
        assert_eq!(
            install.display(),
            format!(
                "install-app {}",
                fx.workspace.join("app/dist/app-0.9.0-py2-none-any.whl").display()
            )
        );
    }

    #[tokio::test]
    async fn test_second_run_skips_dependency_build() {
        let fx = Fixture::new();
        fx.orchestrator(Arc::new(executor()))
            .run(fx.request("master", "p1"))
            .await
            .unwrap();
        assert!(fx.cache().exists("core", "d1"));

        let executor = Arc::new(executor());
        let summary = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert!(summary.dependency_cache_hit);
        assert_eq!(executor.count("build-core"), 0);
        assert_eq!(dependency_commands(&executor, &fx.workspace), 0);
        assert!(summary.states.contains(&PipelineState::SkipDependencyBuild));
        assert!(!summary.states.contains(&PipelineState::BuildDependency));
        // The parent is still built and verified
        assert_eq!(executor.count("build-app"), 1);
        assert_eq!(executor.count("run-tests"), 1);
    }

    #[tokio::test]
    async fn test_cached_dependency_is_linked_from_cache() {
        let fx = Fixture::new();

        // Seed the cache with a prebuilt dependency
        let prebuilt = fx._temp.path().join("prebuilt");
        fs::create_dir_all(prebuilt.join("build/release/lib")).unwrap();
        fs::write(prebuilt.join("build/release/lib/libcore.a"), "lib").unwrap();
        fx.cache()
            .publish("core", "d1", &prebuilt, &PublishOptions::default())
            .unwrap();

        let executor = Arc::new(executor());
        let summary = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        let entry = fx.cache().entry_path("core", "d1").unwrap();
        assert_eq!(summary.dependency_dir, entry);
        assert_eq!(dependency_commands(&executor, &fx.workspace), 0);
        assert_eq!(executor.count("build-core"), 0);
        assert!(!fx.workspace.join("core").exists());

        let build_app = executor
            .calls()
            .into_iter()
            .find(|c| c.display().starts_with("build-app"))
            .unwrap();
        assert_eq!(
            build_app.env.get("CORE_DIR").map(PathBuf::from),
            Some(entry.clone())
        );
        assert_eq!(
            build_app.env.get("CORE_RELEASE").map(PathBuf::from),
            Some(entry.join("build/release"))
        );
        assert!(fx.cache().exists("app", "p1"));
    }

    #[tokio::test]
    async fn test_dependency_build_failure_publishes_nothing() {
        let fx = Fixture::new();
        let executor = Arc::new(executor().fail_on("build-core", 2, "cmake: error"));

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::BuildDependency);
        assert!(matches!(
            failure.source,
            Error::ComponentBuildFailed { ref component, .. } if component == "core"
        ));
        assert!(!fx.cache().exists("core", "d1"));
        assert!(!fx.cache().exists("app", "p1"));
        assert_eq!(executor.count("build-app"), 0);
        assert_eq!(failure.completed.last(), Some(&PipelineState::FetchDependency));
    }

    #[tokio::test]
    async fn test_parent_build_failure_publishes_nothing() {
        let fx = Fixture::new();
        let executor = Arc::new(executor().fail_on("build-app", 1, "compile error"));

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::BuildParent);
        assert!(matches!(failure.source, Error::ComponentBuildFailed { .. }));
        assert!(!fx.cache().exists("app", "p1"));
        assert!(!fx.cache().exists("core", "d1"));
        assert_eq!(executor.count("run-tests"), 0);
        assert!(!fx.workspace.join("app/app.stamp").exists());
    }

    #[tokio::test]
    async fn test_test_failure_is_passed_through() {
        let fx = Fixture::new();
        let executor = Arc::new(executor().fail_on("run-tests", 1, "FAILED test_encoder"));

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::RunVerification);
        match failure.source {
            Error::CommandFailed { diagnostic, .. } => {
                assert_eq!(diagnostic, "FAILED test_encoder")
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
        assert!(!fx.cache().exists("app", "p1"));
        assert!(!fx.settings.artifacts_dir.join("app-sha.txt").exists());
    }

    #[tokio::test]
    async fn test_release_build_stamps_version() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());

        let summary = fx
            .orchestrator(executor)
            .run(fx.request("1.2.3", "1.2.3"))
            .await
            .unwrap();

        assert!(summary.release);
        let init = fs::read_to_string(fx.workspace.join("app/app/__init__.py")).unwrap();
        assert!(init.contains("1.2.3"));
        assert!(!init.contains("0.9.0-dev"));
        assert!(fx.cache().exists("app", "1.2.3"));
    }

    #[tokio::test]
    async fn test_branch_build_is_not_stamped() {
        let fx = Fixture::new();

        let summary = fx
            .orchestrator(Arc::new(executor()))
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert!(!summary.release);
        let version = fs::read_to_string(fx.workspace.join("app/VERSION")).unwrap();
        assert_eq!(version, "0.9.0-dev\n");
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_resolution() {
        let fx = Fixture::new();
        let files: Vec<_> = app_files()
            .into_iter()
            .filter(|(path, _)| *path != ".app_modules")
            .collect();
        let executor = Arc::new(executor_with(&files));

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::ResolveDependencyPin);
        assert!(matches!(failure.source, Error::ManifestMissing { .. }));
        assert_eq!(dependency_commands(&executor, &fx.workspace), 0);
    }

    #[tokio::test]
    async fn test_unknown_parent_revision() {
        let fx = Fixture::new();

        let failure = fx
            .orchestrator(Arc::new(executor()))
            .run(fx.request("master", "0badc0de"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::ResolveParentRevision);
        assert!(matches!(failure.source, Error::RevisionNotFound { .. }));
        assert!(failure.completed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_revision_is_rejected() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "None"))
            .await
            .unwrap_err();

        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_overrides() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());
        let mut request = fx.request("master", "p1");
        request.dependency_revision = Some("d2".to_string());
        request.dependency_remote = Some("None".to_string());

        let summary = fx
            .orchestrator(executor.clone())
            .run(request)
            .await
            .unwrap();

        assert_eq!(summary.dependency.revision.hash(), "d2");
        assert_eq!(summary.dependency.remote.url, CORE_URL);
        assert!(executor.count("git reset --hard d2") >= 1);
        assert!(fx.cache().exists("core", "d2"));
        assert!(!fx.cache().exists("core", "d1"));
    }

    #[tokio::test]
    async fn test_unusable_dependency_key_fails_before_building() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());
        let mut request = fx.request("master", "p1");
        request.dependency_revision = Some("release/1.0".to_string());

        let failure = fx
            .orchestrator(executor.clone())
            .run(request)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::ResolveDependencyPin);
        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert_eq!(dependency_commands(&executor, &fx.workspace), 0);
        assert_eq!(executor.count("build-core"), 0);
        assert_eq!(executor.count("build-app"), 0);
        assert_eq!(executor.count("run-tests"), 0);
        assert!(!fx.cache().exists("app", "p1"));
    }

    #[tokio::test]
    async fn test_unusable_parent_key_fails_before_fetching() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());

        let failure = fx
            .orchestrator(executor.clone())
            .run(fx.request("master", "feature/x"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::ResolveParentRevision);
        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_output_dir_on_cache_root_is_rejected() {
        let fx = Fixture::new();
        let prebuilt = fx._temp.path().join("prebuilt");
        fs::create_dir_all(&prebuilt).unwrap();
        fs::write(prebuilt.join("libcore.a"), "lib").unwrap();
        fx.cache()
            .publish("core", "d1", &prebuilt, &PublishOptions::default())
            .unwrap();

        let executor = Arc::new(executor());
        let mut settings = fx.settings.clone();
        settings.results_dir = settings.cache_root.clone();

        let failure = PipelineOrchestrator::new(executor.clone(), fx.definition.clone(), settings)
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineState::ResolveParentRevision);
        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert!(fx.cache().exists("core", "d1"));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_output_dir_containing_workspace_is_rejected() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.workspace.join("app")).unwrap();
        fs::write(fx.workspace.join("app/setup.py"), "setup()").unwrap();

        let mut settings = fx.settings.clone();
        settings.artifacts_dir = fx.workspace.clone();

        let failure = PipelineOrchestrator::new(Arc::new(executor()), fx.definition.clone(), settings)
            .run(fx.request("master", "p1"))
            .await
            .unwrap_err();

        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert!(fx.workspace.join("app/setup.py").exists());
    }

    #[tokio::test]
    async fn test_outputs_inside_workspace_are_allowed() {
        let fx = Fixture::new();
        let settings = RunSettings::new(&fx.settings.cache_root, &fx.workspace);

        PipelineOrchestrator::new(Arc::new(executor()), fx.definition.clone(), settings.clone())
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert!(settings.results_dir.join("results.xml").exists());
    }

    #[tokio::test]
    async fn test_ci_mode_runs_upload_commands() {
        let fx = Fixture::new();
        let executor = Arc::new(executor());
        let mut settings = fx.settings.clone();
        settings.ci = true;

        PipelineOrchestrator::new(executor.clone(), fx.definition.clone(), settings)
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert_eq!(executor.count("upload-core"), 1);
    }

    #[tokio::test]
    async fn test_previous_outputs_are_replaced() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.settings.results_dir).unwrap();
        fs::write(fx.settings.results_dir.join("stale.xml"), "old").unwrap();

        fx.orchestrator(Arc::new(executor()))
            .run(fx.request("master", "p1"))
            .await
            .unwrap();

        assert!(!fx.settings.results_dir.join("stale.xml").exists());
        assert!(fx.settings.results_dir.join("results.xml").exists());
    }

    #[tokio::test]
    async fn test_execute_streams_events() {
        let fx = Fixture::new();
        let (mut rx, handle) = fx
            .orchestrator(Arc::new(executor()))
            .execute(fx.request("master", "p1"));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(
            events.first(),
            Some(&PipelineEvent::StateEntered {
                state: PipelineState::ResolveParentRevision
            })
        );
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::PipelineCompleted { success: true })
        );
        assert!(events.contains(&PipelineEvent::StateCompleted {
            state: PipelineState::PublishDependencyToCache
        }));
    }
}
