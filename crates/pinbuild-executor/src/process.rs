//! Local child-process executor.

use async_trait::async_trait;
use pinbuild_core::Result;
use pinbuild_core::executor::{CommandExecutor, CommandOutput, CommandSpec};
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of each stream kept for diagnostics.
const DEFAULT_TAIL_LINES: usize = 40;

/// Runs commands as child processes of the pipeline.
///
/// Output is streamed to the log as it arrives; only the last lines of
/// each stream are kept in memory.
pub struct LocalProcessExecutor {
    tail_lines: usize,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Default for LocalProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String, limit: usize) {
    if limit == 0 {
        return;
    }
    if tail.len() == limit {
        tail.pop_front();
    }
    tail.push_back(line);
}

#[async_trait]
impl CommandExecutor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let cmd_display = spec.display();
        info!(command = %cmd_display, dir = %spec.working_dir.display(), "Running command");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut stdout_tail = VecDeque::new();
        let mut stderr_tail = VecDeque::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        // Stream output until both pipes close
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(target: "pinbuild::output", "{}", line);
                            push_tail(&mut stdout_tail, line, self.tail_lines);
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stdout");
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(target: "pinbuild::output", "! {}", line);
                            push_tail(&mut stderr_tail, line, self.tail_lines);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        let output = CommandOutput {
            exit_code: status.code(),
            stdout_tail: stdout_tail.into(),
            stderr_tail: stderr_tail.into(),
        };

        if output.is_success() {
            debug!(command = %cmd_display, "Command succeeded");
        } else {
            warn!(command = %cmd_display, exit_code = ?output.exit_code, "Command failed");
        }

        Ok(output)
    }
}
