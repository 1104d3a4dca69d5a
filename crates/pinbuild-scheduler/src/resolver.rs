//! Dependency pin resolution from the parent's manifest.

use pinbuild_core::pipeline::ManifestSpec;
use pinbuild_core::revision::provided;
use pinbuild_core::{DependencyPin, Error, RemoteRepository, Result, Revision};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Resolves which remote and revision of the dependency a parent tree pins.
#[derive(Debug, Clone)]
pub struct RevisionResolver {
    dependency: String,
    manifest: ManifestSpec,
}

impl RevisionResolver {
    pub fn new(dependency: impl Into<String>, manifest: ManifestSpec) -> Self {
        Self {
            dependency: dependency.into(),
            manifest,
        }
    }

    /// Read the manifest in `parent_dir` and apply caller overrides.
    ///
    /// Overrides win when provided; empty strings and `None` count as
    /// not provided. Only reads from disk.
    pub fn resolve(
        &self,
        parent_dir: &Path,
        remote_override: Option<&str>,
        revision_override: Option<&str>,
    ) -> Result<DependencyPin> {
        let path = parent_dir.join(&self.manifest.path);
        let content = std::fs::read_to_string(&path).map_err(|e| Error::ManifestMissing {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let values = parse_manifest(&content).map_err(|reason| Error::ManifestMissing {
            path: path.clone(),
            reason,
        })?;

        let remote = self.lookup(&values, &self.manifest.remote_key, &path)?;
        let revision = self.lookup(&values, &self.manifest.revision_key, &path)?;

        let remote = match provided(remote_override) {
            Some(url) => {
                info!(dependency = %self.dependency, remote = %url, "Using remote override");
                url.to_string()
            }
            None => remote,
        };
        let revision = match provided(revision_override) {
            Some(rev) => {
                info!(dependency = %self.dependency, revision = %rev, "Using revision override");
                rev.to_string()
            }
            None => revision,
        };

        debug!(dependency = %self.dependency, %remote, %revision, "Resolved dependency pin");

        Ok(DependencyPin {
            remote: RemoteRepository::new(&self.dependency, remote),
            revision: Revision::new(&self.dependency, revision),
        })
    }

    fn lookup(&self, values: &HashMap<String, String>, key: &str, path: &Path) -> Result<String> {
        match values.get(key) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            Some(_) => Err(Error::ManifestMissing {
                path: path.to_path_buf(),
                reason: format!("{} is empty", key),
            }),
            None => Err(Error::ManifestMissing {
                path: path.to_path_buf(),
                reason: format!("{} is not declared", key),
            }),
        }
    }
}

/// Parse `KEY = "value"` assignments. Blank lines and `#` comments are
/// skipped; single quotes, double quotes or bare values are accepted.
pub fn parse_manifest(content: &str) -> std::result::Result<HashMap<String, String>, String> {
    let mut values = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected KEY = value", idx + 1))?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("line {}: invalid key '{}'", idx + 1, key));
        }

        let value = unquote(value.trim())
            .ok_or_else(|| format!("line {}: unterminated string", idx + 1))?;
        values.insert(key.to_string(), value.to_string());
    }

    Ok(values)
}

fn unquote(value: &str) -> Option<&str> {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            return rest.strip_suffix(quote);
        }
    }
    // Bare values may carry a trailing comment
    Some(value.split('#').next().unwrap_or_default().trim())
}
