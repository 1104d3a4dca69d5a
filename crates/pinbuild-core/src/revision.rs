//! Revisions, remotes and dependency pins.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Override values that mean "not provided" on the command line.
pub const OVERRIDE_SENTINELS: &[&str] = &["", "None"];

/// Filter an optional override, treating sentinel values as absent.
pub fn provided(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !OVERRIDE_SENTINELS.contains(v))
}

/// An immutable source revision of one component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{component}@{hash}")]
pub struct Revision {
    component: String,
    hash: String,
}

impl Revision {
    pub fn new(component: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            hash: hash.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn short_hash(&self) -> String {
        self.hash.chars().take(7).collect()
    }
}

/// A source location a component is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{url}")]
pub struct RemoteRepository {
    /// Component the remote serves.
    pub component: String,
    /// Clone URL or local path understood by the VCS client.
    pub url: String,
}

impl RemoteRepository {
    pub fn new(component: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            url: url.into(),
        }
    }
}

/// Remote and revision the parent declares for its dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPin {
    pub remote: RemoteRepository,
    pub revision: Revision,
}
