//! Release detection and version stamping.

use pinbuild_core::Result;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static RELEASE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap());

/// A revision is a release when the branch label and the revision are the
/// same string and that string is `MAJOR.MINOR.PATCH`.
pub fn is_release(branch: &str, revision: &str) -> bool {
    branch == revision && RELEASE_VERSION.is_match(revision)
}

/// Files rewritten by [`stamp_version`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StampOutcome {
    /// Development version that was replaced.
    pub dev_version: String,
    /// Files that contained the development version.
    pub stamped: Vec<PathBuf>,
}

/// Replace every literal occurrence of the development version (the
/// trimmed content of `version_file`) with `release` in each of `files`.
///
/// Files that do not contain the development version are left alone.
/// Unreadable or unwritable files are an error.
pub fn stamp_version(
    root: &Path,
    version_file: &Path,
    files: &[PathBuf],
    release: &str,
) -> Result<StampOutcome> {
    let dev_version = fs::read_to_string(root.join(version_file))?
        .trim()
        .to_string();

    if dev_version.is_empty() {
        warn!(file = %version_file.display(), "Version file is empty, nothing to stamp");
        return Ok(StampOutcome::default());
    }

    info!(from = %dev_version, to = %release, "Stamping release version");

    let mut stamped = Vec::new();
    for file in files {
        let path = root.join(file);
        let content = fs::read_to_string(&path)?;
        if !content.contains(&dev_version) {
            debug!(file = %file.display(), "Development version not present");
            continue;
        }
        fs::write(&path, content.replace(&dev_version, release))?;
        debug!(file = %file.display(), "Stamped");
        stamped.push(file.clone());
    }

    Ok(StampOutcome {
        dev_version,
        stamped,
    })
}
