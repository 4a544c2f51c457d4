//! Process execution for the autoland pipeline.
//!
//! Everything the pipeline does to a repository goes through an external
//! `hg` binary, and pushes ride an external `ssh`; this crate provides the
//! shared plumbing for running those commands with captured output and
//! optional timeouts.
//!
//! # Example
//!
//! ```
//! use autoland_process::run_command;
//!
//! let result = run_command("echo", &["hello"]).expect("run");
//! assert!(result.success);
//! assert!(result.stdout.contains("hello"));
//! ```

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command exited zero.
    pub success: bool,
    /// Exit code (if available).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Turn a non-zero exit into an error carrying the stderr tail.
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }

    pub fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (or -1 when not available).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Whether execution exceeded the timeout.
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run a command and capture its output.
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command in a specific directory.
pub fn run_command_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                program,
                args,
                dir.display()
            )
        })?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command with extra environment variables.
pub fn run_command_with_env(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
) -> Result<CommandResult> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command with an optional wall-clock timeout. The child is killed
/// when the deadline passes and the result is marked `timed_out`.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let Some(timeout_dur) = timeout else {
        let output = run_command_in_dir(program, args, working_dir)?;
        return Ok(CommandOutput {
            exit_code: output.exit_code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
            duration: Duration::from_millis(output.duration_ms),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", program))?;

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {}", program))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        program,
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check if a command exists in PATH.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_captures_stdout() {
        let result = run_command("echo", &["hello"]).expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    fn run_command_reports_failure() {
        let result = run_command("false", &[]).expect("run");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
    }

    #[test]
    fn run_command_in_dir_uses_cwd() {
        let result = run_command_in_dir("pwd", &[], Path::new("/")).expect("run");
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "/");
    }

    #[test]
    fn command_result_ok() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
        };
        assert!(result.ok().is_ok());
    }

    #[test]
    fn command_result_err_carries_stderr() {
        let result = CommandResult {
            success: false,
            exit_code: Some(255),
            stdout: "".to_string(),
            stderr: "abort: repository not found".to_string(),
            duration_ms: 100,
        };
        let err = result.ok().unwrap_err();
        assert!(err.to_string().contains("repository not found"));
    }

    #[test]
    fn run_command_with_env_passes_variables() {
        let result = run_command_with_env(
            "sh",
            &["-c", "echo $AUTOLAND_TEST_VAR"],
            Path::new("."),
            &[("AUTOLAND_TEST_VAR".to_string(), "landed".to_string())],
        )
        .expect("run");
        assert_eq!(result.stdout.trim(), "landed");
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let output = run_command_with_timeout(
            "sleep",
            &["5"],
            Path::new("."),
            Some(Duration::from_millis(200)),
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code, -1);
        assert!(output.stderr.contains("timed out"));
    }

    #[test]
    fn no_timeout_completes_normally() {
        let output =
            run_command_with_timeout("echo", &["fast"], Path::new("."), None).expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("fast"));
    }

    #[test]
    fn command_exists_for_shell() {
        assert!(command_exists("sh"));
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn which_finds_shell() {
        assert!(which("sh").is_some());
    }
}
