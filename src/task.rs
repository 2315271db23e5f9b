//! External command execution
//!
//! Two interchangeable strategies satisfy [`TaskExecutor`]:
//! - [`TerminalTaskExecutor`] runs the command attached to the daemon's
//!   terminal so the user sees it live; output is not captured.
//! - [`DirectTaskExecutor`] spawns the process with piped stdio and captures
//!   stdout/stderr for the build status.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::WorkspaceError;

/// A command to run in the workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Free-form kind used for logging (`build`, `diff`)
    pub kind: String,
    pub command: String,
    pub args: Vec<String>,
}

impl Task {
    pub fn new(kind: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            kind: kind.to_string(),
            command: command.to_string(),
            args,
        }
    }

    /// Shell-quoted command line, for display
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Uniform result of a finished task
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Exit code, -1 when the process was killed by a signal
    pub code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Monotonic timestamp taken right before launch
    pub start_time: Instant,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Runs a [`Task`] to completion
///
/// Only launch-level failures (missing binary, bad working directory) are
/// errors. A non-zero exit is a normal result.
pub trait TaskExecutor: Send + Sync {
    fn run(&self, task: &Task) -> Result<TaskResult, WorkspaceError>;
}

/// Which strategy the daemon uses for builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExecutorKind {
    /// Output goes to the daemon's terminal
    Terminal,
    /// Output is captured and reported to views
    #[default]
    Direct,
}

pub fn executor(kind: ExecutorKind, cwd: &Path) -> Arc<dyn TaskExecutor> {
    match kind {
        ExecutorKind::Terminal => Arc::new(TerminalTaskExecutor::new(cwd)),
        ExecutorKind::Direct => Arc::new(DirectTaskExecutor::new(cwd)),
    }
}

#[derive(Debug, Clone)]
pub struct TerminalTaskExecutor {
    cwd: PathBuf,
}

impl TerminalTaskExecutor {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

impl TaskExecutor for TerminalTaskExecutor {
    fn run(&self, task: &Task) -> Result<TaskResult, WorkspaceError> {
        info!(kind = %task.kind, command = %task.command_line(), "Running task");
        let start_time = Instant::now();
        let status = Command::new(&task.command)
            .args(&task.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| WorkspaceError::TaskLaunch {
                command: task.command.clone(),
                source,
            })?;
        Ok(TaskResult {
            code: status.code().unwrap_or(-1),
            stdout: None,
            stderr: None,
            start_time,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DirectTaskExecutor {
    cwd: PathBuf,
}

impl DirectTaskExecutor {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

impl TaskExecutor for DirectTaskExecutor {
    fn run(&self, task: &Task) -> Result<TaskResult, WorkspaceError> {
        debug!(kind = %task.kind, command = %task.command_line(), "Spawning task");
        let start_time = Instant::now();
        let output = Command::new(&task.command)
            .args(&task.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| WorkspaceError::TaskLaunch {
                command: task.command.clone(),
                source,
            })?;
        Ok(TaskResult {
            code: output.status.code().unwrap_or(-1),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            start_time,
        })
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> Task {
        Task::new("build", "sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_command_line_quoting() {
        let task = Task::new(
            "build",
            "make",
            vec!["-j4".to_string(), "build/a b.o".to_string(), "it's".to_string()],
        );
        assert_eq!(task.command_line(), r"make -j4 'build/a b.o' 'it'\''s'");
    }

    #[test]
    fn test_direct_captures_output() {
        let dir = tempdir().unwrap();
        let executor = DirectTaskExecutor::new(dir.path());
        let result = executor.run(&sh("echo out; echo err >&2")).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.as_deref(), Some("out\n"));
        assert_eq!(result.stderr.as_deref(), Some("err\n"));
    }

    #[test]
    fn test_direct_nonzero_exit_is_result() {
        let dir = tempdir().unwrap();
        let executor = DirectTaskExecutor::new(dir.path());
        let result = executor.run(&sh("echo 'syntax error' >&2; exit 3")).unwrap();
        assert_eq!(result.code, 3);
        assert!(!result.success());
        assert_eq!(result.stderr.as_deref(), Some("syntax error\n"));
    }

    #[test]
    fn test_direct_runs_in_workspace_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();
        let executor = DirectTaskExecutor::new(dir.path());
        let result = executor.run(&sh("cat marker")).unwrap();
        assert_eq!(result.stdout.as_deref(), Some("here"));
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let dir = tempdir().unwrap();
        for executor in [
            executor(ExecutorKind::Direct, dir.path()),
            executor(ExecutorKind::Terminal, dir.path()),
        ] {
            let task = Task::new("build", "definitely-not-a-real-binary-xyz", Vec::new());
            assert!(matches!(
                executor.run(&task),
                Err(WorkspaceError::TaskLaunch { .. })
            ));
        }
    }

    #[test]
    fn test_terminal_reports_exit_code_without_output() {
        let dir = tempdir().unwrap();
        let executor = TerminalTaskExecutor::new(dir.path());
        let result = executor.run(&sh("exit 1")).unwrap();
        assert_eq!(result.code, 1);
        assert!(result.stdout.is_none());
        assert!(result.stderr.is_none());
        assert!(result.elapsed() >= Duration::ZERO);
    }
}
