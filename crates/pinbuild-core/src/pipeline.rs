//! Pipeline definitions, run parameters and orchestration states.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The two-component pipeline declared in `pinbuild.kdl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "nupic").
    pub name: String,
    /// The native component the parent depends on.
    pub dependency: DependencySpec,
    /// The higher-level component pinning the dependency.
    pub parent: ParentSpec,
    /// Extra variables added to the build environment.
    pub env: BTreeMap<String, String>,
}

/// Settings shared by both components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component name; also the checkout directory and cache namespace.
    pub name: String,
    /// Environment variable that receives the component's directory.
    pub dir_var: String,
    /// Stale build outputs removed before building.
    pub clean: Vec<PathBuf>,
    /// Subtrees pruned before building and never copied into the cache.
    pub exclude: Vec<PathBuf>,
    /// Compile commands.
    pub build: Vec<String>,
    /// Packaging/install-driver commands run after a successful compile.
    pub package: Vec<String>,
    /// Extra packaging commands run only in CI mode (uploads).
    pub ci_package: Vec<String>,
}

/// The dependency component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySpec {
    pub component: ComponentSpec,
    /// Build output subdirectory the parent links against.
    pub output_dir: Option<PathBuf>,
    /// Environment variable that receives `<dir>/<output_dir>`.
    pub output_var: Option<String>,
}

/// The parent component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentSpec {
    pub component: ComponentSpec,
    /// Where the dependency pin is declared.
    pub manifest: ManifestSpec,
    /// Single-line file holding the development version.
    pub version_file: PathBuf,
    /// Files whose development version is replaced on release builds.
    pub stamp_files: Vec<PathBuf>,
    /// Where the installable package is produced.
    pub package: PackageSpec,
    /// Diagnostic marker written after a successful build.
    pub marker: Option<PathBuf>,
    /// Commands installing the produced package; `${package}` is bound.
    pub install: Vec<String>,
    /// Smoke test followed by the full test harness.
    pub test: Vec<String>,
    /// Where the harness leaves its report.
    pub report: ReportSpec,
}

/// Location and keys of the dependency manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub path: PathBuf,
    pub remote_key: String,
    pub revision_key: String,
}

impl Default for ManifestSpec {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".dependency_modules"),
            remote_key: "DEPENDENCY_REMOTE".to_string(),
            revision_key: "DEPENDENCY_COMMITISH".to_string(),
        }
    }
}

/// A directory holding files with a given extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for PackageSpec {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("dist"),
            extension: "whl".to_string(),
        }
    }
}

/// Results subtree searched for the test report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSpec {
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for ReportSpec {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("tests/results/xunit"),
            extension: "xml".to_string(),
        }
    }
}

/// Per-run parameters supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Directory holding one checkout per component.
    pub workspace: PathBuf,
    /// Where the parent is fetched from.
    pub parent_remote: String,
    /// Branch label the caller asked for.
    pub parent_branch: String,
    /// Parent revision to build.
    pub parent_revision: String,
    /// Replaces the manifest's dependency remote when provided.
    pub dependency_remote: Option<String>,
    /// Replaces the manifest's dependency revision when provided.
    pub dependency_revision: Option<String>,
}

/// Locations and switches that hold across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Root of the permanent artifact cache.
    pub cache_root: PathBuf,
    /// Per-run output for pointer files.
    pub artifacts_dir: PathBuf,
    /// Per-run output for test reports.
    pub results_dir: PathBuf,
    /// Running under continuous integration: adds upload sub-steps.
    pub ci: bool,
}

impl RunSettings {
    pub fn new(cache_root: impl AsRef<Path>, output_root: impl AsRef<Path>) -> Self {
        let output_root = output_root.as_ref();
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
            artifacts_dir: output_root.join("artifacts"),
            results_dir: output_root.join("results"),
            ci: false,
        }
    }
}

/// States of the pipeline state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum PipelineState {
    #[display("resolve-parent-revision")]
    ResolveParentRevision,
    #[display("stamp-version-if-release")]
    StampVersionIfRelease,
    #[display("resolve-dependency-pin")]
    ResolveDependencyPin,
    #[display("check-dependency-cache")]
    CheckDependencyCache,
    #[display("fetch-dependency")]
    FetchDependency,
    #[display("build-dependency")]
    BuildDependency,
    #[display("skip-dependency-build")]
    SkipDependencyBuild,
    #[display("register-dependency-environment")]
    RegisterDependencyEnvironment,
    #[display("build-parent")]
    BuildParent,
    #[display("install-parent-package")]
    InstallParentPackage,
    #[display("run-verification")]
    RunVerification,
    #[display("publish-parent-to-cache")]
    PublishParentToCache,
    #[display("publish-dependency-to-cache")]
    PublishDependencyToCache,
    #[display("done")]
    Done,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done)
    }
}

/// Build outputs left by a successful build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub component: String,
    /// Component tree the build ran in.
    pub root: PathBuf,
    /// Directory dependents should link against.
    pub output_path: PathBuf,
}

/// Report relocated by a successful verification stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub component: String,
    pub path: PathBuf,
}
