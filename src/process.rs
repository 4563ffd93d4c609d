//! External process execution with timeout and output limits.
//!
//! Commands run through `/bin/sh -c`. Stdout and stderr are drained on
//! reader threads so a chatty child cannot stall on a full pipe while we
//! poll for exit. Each child leads its own process group; when the deadline
//! passes the whole group is killed, including background jobs that still
//! hold the output pipes after the shell itself has exited.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use miette::Diagnostic;
use thiserror::Error;

/// Maximum retained size of each of stdout and stderr (64 KB).
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors from running an external process.
#[derive(Debug, Error, Diagnostic)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    #[diagnostic(
        code(tripwire::process::spawn),
        help("Check that /bin/sh exists and the process limit is not exhausted.")
    )]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {}ms: {command}", timeout.as_millis())]
    #[diagnostic(
        code(tripwire::process::timeout),
        help("The process was killed. Raise the timeout or make the command finish sooner.")
    )]
    Timeout { command: String, timeout: Duration },

    #[error("failed to wait on `{command}`: {source}")]
    #[diagnostic(code(tripwire::process::wait))]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A shell command plus the environment and deadline to run it with.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a process that exited on its own.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line failure description for logs.
    pub fn failure_message(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {stderr}")
        }
    }
}

/// Run a shell command to completion or until its timeout.
///
/// The deadline covers both the shell's exit and the draining of its output:
/// a background child that keeps stdout open past the deadline is a timeout.
pub fn run(cmd: &ShellCommand) -> Result<ProcessOutput, ProcessError> {
    let started = Instant::now();
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&cmd.command)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| ProcessError::Spawn {
            command: cmd.command.clone(),
            source: e,
        })?;

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = started + cmd.timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_group(&mut child);
                    let _ = child.wait();
                    return Err(timed_out(cmd));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_group(&mut child);
                return Err(ProcessError::Wait {
                    command: cmd.command.clone(),
                    source: e,
                });
            }
        }
    };

    let (stdout, stderr) = match (
        collect_reader(stdout_reader, deadline),
        collect_reader(stderr_reader, deadline),
    ) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            // The shell is gone but something in its group still holds a pipe.
            kill_group(&mut child);
            return Err(timed_out(cmd));
        }
    };

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

fn timed_out(cmd: &ShellCommand) -> ProcessError {
    tracing::debug!(command = %cmd.command, "process group killed after timeout");
    ProcessError::Timeout {
        command: cmd.command.clone(),
        timeout: cmd.timeout,
    }
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid only signals; it touches no memory.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Wait for a reader to hit EOF, no later than `deadline`. `None` on timeout.
fn collect_reader(reader: Option<Receiver<Vec<u8>>>, deadline: Instant) -> Option<String> {
    let Some(rx) = reader else {
        return Some(String::new());
    };
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(bytes) => Some(truncate_output(&String::from_utf8_lossy(&bytes))),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Quote a value for safe inclusion as one `/bin/sh` word.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run(&ShellCommand::new("echo hi; echo oops >&2", Duration::from_secs(5))).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let out = run(&ShellCommand::new("exit 3", Duration::from_secs(5))).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.failure_message(), "exit code 3");
    }

    #[test]
    fn env_is_passed_through() {
        let cmd = ShellCommand::new("printf %s \"$TW_TEST\"", Duration::from_secs(5))
            .with_env("TW_TEST", "value");
        assert_eq!(run(&cmd).unwrap().stdout, "value");
    }

    #[test]
    fn slow_command_times_out() {
        let err = run(&ShellCommand::new("sleep 5", Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn background_child_holding_pipes_times_out() {
        let started = Instant::now();
        let err = run(&ShellCommand::new("sleep 5 & echo x", Duration::from_millis(300))).unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn background_child_that_detaches_output_is_fine() {
        let out = run(&ShellCommand::new(
            "sleep 5 >/dev/null 2>&1 & echo x",
            Duration::from_secs(2),
        ))
        .unwrap();
        assert_eq!(out.stdout.trim(), "x");
    }

    #[test]
    fn quoting_round_trips_through_shell() {
        let value = "it's a \"test\" $HOME";
        let cmd = ShellCommand::new(format!("printf %s {}", shell_quote(value)), Duration::from_secs(5));
        assert_eq!(run(&cmd).unwrap().stdout, value);
        assert_eq!(shell_quote("plain-word"), "plain-word");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT_SIZE);
        let t = truncate_output(&long);
        assert!(t.ends_with("..."));
        assert!(t.len() <= MAX_OUTPUT_SIZE + 3);
    }
}
