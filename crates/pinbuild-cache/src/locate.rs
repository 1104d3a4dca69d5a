//! Locating produced files (packages, test reports) by extension.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Files under `dir` with the given extension, sorted by path.
///
/// `max_depth` of 1 only looks at direct children. A missing `dir`
/// yields an empty list.
pub fn find_files(dir: &Path, extension: &str, max_depth: usize) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(max_depth) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(extension)
        {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// The most recently modified of `files`; ties go to the later path.
pub fn newest_file(files: &[PathBuf]) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, &PathBuf)> = None;
    for file in files {
        let modified = std::fs::metadata(file)?.modified()?;
        match newest {
            Some((time, _)) if time > modified => {}
            _ => newest = Some((modified, file)),
        }
    }
    Ok(newest.map(|(_, path)| path.clone()))
}
