//! Revision-keyed artifact store.

use crate::copy::{copy_tree, remove_if_present};
use crate::locate::{find_files, newest_file};
use pinbuild_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_PREFIX: &str = ".staging-";

/// A materialized cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub component: String,
    pub revision: String,
    pub path: PathBuf,
}

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The entry was created by this call.
    Published {
        entry: CacheEntry,
        package: Option<PackageRecord>,
    },
    /// The entry already existed; nothing was written.
    AlreadyPresent(CacheEntry),
}

impl PublishOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Package extraction for the parent component.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    /// Package directory relative to the published tree.
    pub dir: PathBuf,
    /// Package file extension, without the dot.
    pub extension: String,
    /// Per-run output directory receiving the pointer files.
    pub artifacts_dir: PathBuf,
}

/// Options for [`ArtifactCache::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Paths relative to the source tree that are never cached.
    pub exclude: Vec<PathBuf>,
    /// Set for the parent component.
    pub package: Option<PackageRequest>,
}

/// Pointer files written for a published parent package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub revision: String,
    pub file_name: String,
    /// File holding `<revision>:<file_name>`.
    pub version_pointer: PathBuf,
    /// File holding the bare revision.
    pub sha_pointer: PathBuf,
}

impl PackageRecord {
    /// The manifest line downstream consumers read.
    pub fn manifest_line(revision: &str, file_name: &str) -> String {
        format!("{}:{}", revision, file_name)
    }
}

/// Local, append-only store of build trees keyed by component and revision.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<component>/<revision>`, rejecting keys that are not a
    /// single plain path segment.
    pub fn entry_path(&self, component: &str, revision: &str) -> Result<PathBuf> {
        validate_segment("component", component)?;
        validate_segment("revision", revision)?;
        Ok(self.root.join(component).join(revision))
    }

    /// Whether a complete entry exists for the key. Never writes.
    pub fn exists(&self, component: &str, revision: &str) -> bool {
        match self.entry_path(component, revision) {
            Ok(path) => path.is_dir(),
            Err(_) => false,
        }
    }

    pub fn entry(&self, component: &str, revision: &str) -> Option<CacheEntry> {
        let path = self.entry_path(component, revision).ok()?;
        path.is_dir().then(|| CacheEntry {
            component: component.to_string(),
            revision: revision.to_string(),
            path,
        })
    }

    /// Revisions cached for a component, sorted.
    pub fn revisions(&self, component: &str) -> Result<Vec<String>> {
        validate_segment("component", component)?;
        let dir = self.root.join(component);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut revisions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                revisions.push(name);
            }
        }
        revisions.sort();
        Ok(revisions)
    }

    /// Copy `source_dir` into the store under `(component, revision)`.
    ///
    /// A no-op when the key already exists. The copy goes to a staging
    /// directory that is renamed into place only once complete, so a
    /// failed publish leaves nothing visible to [`exists`](Self::exists).
    pub fn publish(
        &self,
        component: &str,
        revision: &str,
        source_dir: &Path,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let entry_path = self.entry_path(component, revision)?;
        let entry = CacheEntry {
            component: component.to_string(),
            revision: revision.to_string(),
            path: entry_path.clone(),
        };

        if entry_path.is_dir() {
            debug!(component, revision, path = %entry_path.display(), "Cache entry already exists");
            return Ok(PublishOutcome::AlreadyPresent(entry));
        }

        let cache_err = |message: String| Error::CacheWrite {
            component: component.to_string(),
            revision: revision.to_string(),
            message,
        };

        // Resolve the package before copying so a missing package never
        // leaves a registered entry behind.
        let package_file = match &options.package {
            Some(request) => Some(locate_package(source_dir, request).map_err(&cache_err)?),
            None => None,
        };

        let component_dir = self.root.join(component);
        fs::create_dir_all(&component_dir)
            .map_err(|e| cache_err(format!("creating {}: {}", component_dir.display(), e)))?;

        let staging = component_dir.join(format!(
            "{}{}-{}",
            STAGING_PREFIX,
            revision,
            Uuid::now_v7().simple()
        ));

        info!(component, revision, path = %entry_path.display(), "Caching build");

        if let Err(e) = copy_tree(source_dir, &staging, &options.exclude) {
            discard_staging(&staging);
            return Err(cache_err(format!(
                "copying {} failed: {}",
                source_dir.display(),
                e
            )));
        }

        // Pointer files must exist before the entry becomes visible.
        let package = match (&options.package, package_file) {
            (Some(request), Some(file_name)) => {
                match write_package_record(revision, &file_name, &request.artifacts_dir, component) {
                    Ok(record) => Some(record),
                    Err(message) => {
                        discard_staging(&staging);
                        return Err(cache_err(message));
                    }
                }
            }
            _ => None,
        };

        if let Err(e) = fs::rename(&staging, &entry_path) {
            discard_staging(&staging);
            if entry_path.is_dir() {
                // Another run published the same key first.
                warn!(component, revision, "Cache entry appeared during publish, keeping existing");
                return Ok(PublishOutcome::AlreadyPresent(entry));
            }
            return Err(cache_err(format!(
                "moving entry into place failed: {}",
                e
            )));
        }

        info!(component, revision, "Cached locally");
        Ok(PublishOutcome::Published { entry, package })
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.chars().any(char::is_control)
    {
        return Err(Error::InvalidInput(format!(
            "{} '{}' is not usable as a cache key",
            field, value
        )));
    }
    Ok(())
}

fn discard_staging(staging: &Path) {
    if let Some(parent) = staging.parent() {
        if let Some(name) = staging.file_name() {
            if let Err(e) = remove_if_present(parent, Path::new(name)) {
                warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// File name of the package to record for the parent.
fn locate_package(source_dir: &Path, request: &PackageRequest) -> std::result::Result<String, String> {
    let dir = source_dir.join(&request.dir);
    let files = find_files(&dir, &request.extension, 1)
        .map_err(|e| format!("scanning {}: {}", dir.display(), e))?;

    if files.len() > 1 {
        warn!(dir = %dir.display(), count = files.len(), "Several packages found, recording the newest");
    }

    let newest = newest_file(&files).map_err(|e| format!("reading package metadata: {}", e))?;
    let path = newest.ok_or_else(|| {
        format!(
            "no *.{} package found in {}",
            request.extension,
            dir.display()
        )
    })?;

    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| format!("package path {} has no file name", path.display()))
}

fn write_package_record(
    revision: &str,
    file_name: &str,
    artifacts_dir: &Path,
    component: &str,
) -> std::result::Result<PackageRecord, String> {
    fs::create_dir_all(artifacts_dir)
        .map_err(|e| format!("creating {}: {}", artifacts_dir.display(), e))?;

    let version_pointer = artifacts_dir.join(format!("{}-package-version.txt", component));
    let sha_pointer = artifacts_dir.join(format!("{}-sha.txt", component));

    fs::write(
        &version_pointer,
        PackageRecord::manifest_line(revision, file_name),
    )
    .map_err(|e| format!("writing {}: {}", version_pointer.display(), e))?;
    fs::write(&sha_pointer, revision)
        .map_err(|e| format!("writing {}: {}", sha_pointer.display(), e))?;

    debug!(file = %file_name, dir = %artifacts_dir.display(), "Wrote package pointers");

    Ok(PackageRecord {
        revision: revision.to_string(),
        file_name: file_name.to_string(),
        version_pointer,
        sha_pointer,
    })
}
