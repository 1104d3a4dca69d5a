//! Variable interpolation for configured command strings.
//!
//! Supports variables like:
//! - `${git.sha}` - Revision being built
//! - `${git.short_sha}` - Short (7 char) revision
//! - `${git.branch}` - Branch label of the run
//! - `${component.name}` - Component the command belongs to
//! - `${component.dir}` - Checkout directory of that component
//! - `${env.VAR_NAME}` - Build environment variable
//! - `${package}` - Custom variables (e.g. the installable package path)
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use pinbuild_core::BuildEnvironment;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Revision-related variables
    pub git: GitContext,
    /// The component whose command is being expanded
    pub component: ComponentContext,
    /// Build environment variables
    pub env: HashMap<String, String>,
    /// Custom variables bound by a stage
    pub custom: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
}

/// Component context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct ComponentContext {
    pub name: String,
    pub dir: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["component", "name"] => Some(self.component.name.clone()),
            ["component", "dir"] => Some(self.component.dir.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate for a `sh -c` script.
    ///
    /// Substituted values that are not plain shell words are single-quoted,
    /// so paths containing spaces stay one argument. Unknown variables are
    /// left untouched. Do not quote variables in the configured command as
    /// well.
    pub fn interpolate_shell(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                match self.resolve(var_name) {
                    Some(value) => shell_quote(&value),
                    None => format!("${{{}}}", var_name),
                }
            })
            .to_string()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_component(mut self, name: impl Into<String>, dir: &Path) -> Self {
        self.ctx.component.name = name.into();
        self.ctx.component.dir = dir.to_string_lossy().to_string();
        self
    }

    pub fn with_environment(mut self, env: &BuildEnvironment) -> Self {
        self.ctx
            .env
            .extend(env.vars().iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}
