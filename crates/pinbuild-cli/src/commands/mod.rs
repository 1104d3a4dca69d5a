//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use pinbuild_cache::ArtifactCache;
use pinbuild_config::load_pipeline;
use pinbuild_scheduler::is_release;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    match load_pipeline(path) {
        Ok(pipeline) => {
            println!("Configuration is valid");
            println!(
                "  pipeline {}: {} depends on {}",
                pipeline.name, pipeline.parent.component.name, pipeline.dependency.component.name
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn cache_status(cache_root: &Path, component: &str, revision: &str) -> Result<()> {
    let cache = ArtifactCache::new(cache_root);
    let path = cache
        .entry_path(component, revision)
        .context("Invalid cache key")?;

    match cache.entry(component, revision) {
        Some(entry) => println!("cached   {}", entry.path.display()),
        None => {
            println!("missing  {}", path.display());
            std::process::exit(1);
        }
    }
    Ok(())
}

pub fn cache_list(cache_root: &Path, component: &str) -> Result<()> {
    let cache = ArtifactCache::new(cache_root);
    let revisions = cache
        .revisions(component)
        .with_context(|| format!("Failed to list cache for {}", component))?;

    if revisions.is_empty() {
        println!("No cached builds of {}", component);
    }
    for revision in revisions {
        println!("{}", revision);
    }
    Ok(())
}

pub fn release_check(branch: &str, revision: &str) {
    if is_release(branch, revision) {
        println!("release: {} will be stamped into the version files", revision);
    } else {
        println!("not a release: version files are left as they are");
    }
}
