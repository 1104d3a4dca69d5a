//! Tree copy with an exclude list.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Copy `src` into `dst`, skipping any entry whose path relative to `src`
/// equals or lies under one of `exclude`.
///
/// Symlinks are recreated rather than followed. Returns the number of
/// files copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[PathBuf]) -> io::Result<u64> {
    let mut copied = 0;

    let walker = WalkDir::new(src).follow_links(false).into_iter();
    let walker = walker.filter_entry(|entry| {
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        !is_excluded(rel, exclude)
    });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    debug!(src = %src.display(), dst = %dst.display(), files = copied, "Copied tree");
    Ok(copied)
}

fn is_excluded(rel: &Path, exclude: &[PathBuf]) -> bool {
    !rel.as_os_str().is_empty() && exclude.iter().any(|ex| rel.starts_with(ex))
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Remove `rel` under `root` if present. Missing paths are not an error.
pub fn remove_if_present(root: &Path, rel: &Path) -> io::Result<bool> {
    let path = root.join(rel);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).map(|_| true),
        Ok(_) => fs::remove_file(&path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
