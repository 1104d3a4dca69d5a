//! Executor trait and command types.
//!
//! Every external collaborator (VCS client, native toolchain, packaging
//! tool, test harness) is reached through a [`CommandExecutor`]. The
//! pipeline only cares whether an invocation succeeded or failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{BuildEnvironment, Error, Result};

/// Shell used to run configured command strings.
pub const SHELL: &str = "/bin/sh";

/// Specification for one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            env: BTreeMap::new(),
        }
    }

    /// A command string run through [`SHELL`].
    pub fn shell(script: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self::new(SHELL, working_dir).arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn environment(mut self, env: &BuildEnvironment) -> Self {
        self.env
            .extend(env.vars().iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// The script of a shell command, if this is one.
    pub fn script(&self) -> Option<&str> {
        match self.args.as_slice() {
            [flag, script] if self.program == SHELL && flag == "-c" => Some(script.as_str()),
            _ => None,
        }
    }

    /// Human readable command line for logs and errors.
    pub fn display(&self) -> String {
        if let Some(script) = self.script() {
            return script.to_string();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Last lines written to stdout.
    pub stdout_tail: Vec<String>,
    /// Last lines written to stderr.
    pub stderr_tail: Vec<String>,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout_tail: Vec::new(),
            stderr_tail: vec![stderr.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Diagnostic text for a failed command: stderr if any, else stdout.
    pub fn diagnostic(&self) -> String {
        let lines = if self.stderr_tail.is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        lines.join("\n")
    }
}

/// Trait for running external commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a command to completion.
    ///
    /// A non-zero exit is reported through [`CommandOutput::exit_code`];
    /// `Err` is reserved for failures to run the command at all.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;

    /// Run a command and turn a non-zero exit into [`Error::CommandFailed`].
    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let command = spec.display();
        let output = self.run(spec).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(Error::CommandFailed {
                command,
                exit_code: output.exit_code,
                diagnostic: output.diagnostic(),
            })
        }
    }
}
