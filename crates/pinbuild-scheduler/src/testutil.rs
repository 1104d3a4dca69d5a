//! Recording command executor for pipeline tests.

use async_trait::async_trait;
use pinbuild_core::Result;
use pinbuild_core::executor::{CommandExecutor, CommandOutput, CommandSpec};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Content served by a fake remote.
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    pub files: Vec<(PathBuf, String)>,
    pub revisions: Vec<String>,
}

/// Logs every command and simulates the side effects of the tools the
/// pipeline drives: `git clone` materializes the remote's files, `git reset`
/// fails for unknown revisions, and shell commands matching a registered
/// prefix create files in their working directory.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    checkouts: Mutex<HashMap<PathBuf, String>>,
    remotes: HashMap<String, FakeRemote>,
    effects: Vec<(String, Vec<(PathBuf, String)>)>,
    failures: Vec<(String, CommandOutput)>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, url: &str, files: &[(&str, &str)], revisions: &[&str]) -> Self {
        self.remotes.insert(
            url.to_string(),
            FakeRemote {
                files: files
                    .iter()
                    .map(|(path, content)| (PathBuf::from(path), content.to_string()))
                    .collect(),
                revisions: revisions.iter().map(|r| r.to_string()).collect(),
            },
        );
        self
    }

    /// Commands starting with `prefix` create `files` under their working dir.
    pub fn on_command(mut self, prefix: &str, files: &[(&str, &str)]) -> Self {
        self.effects.push((
            prefix.to_string(),
            files
                .iter()
                .map(|(path, content)| (PathBuf::from(path), content.to_string()))
                .collect(),
        ));
        self
    }

    /// Commands starting with `prefix` exit with `code` and print `stderr`.
    pub fn fail_on(mut self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.failures
            .push((prefix.to_string(), CommandOutput::failure(code, stderr)));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    /// Number of recorded commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Index of the first recorded command starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.starts_with(prefix))
    }

    fn git(&self, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["clone", url, name] => {
                let Some(remote) = self.remotes.get(*url) else {
                    return CommandOutput::failure(128, "fatal: repository not found");
                };
                let dir = spec.working_dir.join(name);
                for (path, content) in &remote.files {
                    write_file(&dir, path, content);
                }
                self.checkouts
                    .lock()
                    .unwrap()
                    .insert(dir, url.to_string());
                CommandOutput::success()
            }
            ["fetch", url, ..] => {
                if !self.remotes.contains_key(*url) {
                    return CommandOutput::failure(128, "fatal: could not read from remote");
                }
                self.checkouts
                    .lock()
                    .unwrap()
                    .insert(spec.working_dir.clone(), url.to_string());
                CommandOutput::success()
            }
            ["reset", "--hard", revision] => {
                let checkouts = self.checkouts.lock().unwrap();
                let known = checkouts
                    .get(&spec.working_dir)
                    .and_then(|url| self.remotes.get(url))
                    .map(|remote| remote.revisions.iter().any(|r| r == revision))
                    .unwrap_or(true);
                if known {
                    CommandOutput::success()
                } else {
                    CommandOutput::failure(
                        128,
                        &format!("fatal: ambiguous argument '{}': unknown revision", revision),
                    )
                }
            }
            _ => CommandOutput::success(),
        }
    }
}

fn write_file(root: &Path, rel: &Path, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let display = spec.display();

        if let Some((_, output)) = self
            .failures
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
        {
            return Ok(output.clone());
        }

        if spec.program == "git" {
            return Ok(self.git(&spec));
        }

        for (prefix, files) in &self.effects {
            if display.starts_with(prefix.as_str()) {
                for (path, content) in files {
                    write_file(&spec.working_dir, path, content);
                }
            }
        }
        Ok(CommandOutput::success())
    }
}
