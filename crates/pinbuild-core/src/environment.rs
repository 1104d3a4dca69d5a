//! Build environment threaded through every external invocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Named variables handed to external tools as their process environment.
///
/// Created once per run and only ever extended: once a component's
/// location is known it is registered here so later stages can find it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the environment from the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Set a variable, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Register a filesystem location under `key`.
    pub fn set_path(&mut self, key: impl Into<String>, path: &Path) {
        self.set(key, path.to_string_lossy());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn extend<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    /// Dump the environment at debug level before a stage runs.
    pub fn log_diagnostics(&self, stage: &str) {
        debug!(stage = %stage, vars = self.vars.len(), "Build environment");
        for (key, value) in &self.vars {
            debug!(stage = %stage, "  {}={}", key, value);
        }
    }
}
