//! External command execution

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::process::cancel::CancelToken;
use crate::utils::tail;

/// Grace period for output readers after the child exits. Daemons started by a
/// script may inherit its pipes and keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    /// Run `command` through `sh -c`
    pub fn shell(command: &str, timeout: Duration) -> Self {
        Self::new("sh", timeout).arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human readable command line
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn is_accepted(&self, accepted: &[i32]) -> bool {
        self.exit_code.is_some_and(|code| accepted.contains(&code))
    }

    /// Turn a non-accepted exit into a script error
    pub fn check(self, spec: &CommandSpec, accepted: &[i32]) -> Result<Self, AgentError> {
        if self.is_accepted(accepted) {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(AgentError::ScriptError {
            command: spec.display(),
            exit_code: self.exit_code,
            stderr_tail: tail(detail.trim(), 1024).to_string(),
        })
    }
}

/// Runs external commands. Non-zero exits are returned as output; failing to
/// start, timing out and cancellation are errors.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, AgentError>;
}

/// Runs commands as child processes, each in its own process group
#[derive(Debug, Clone)]
pub struct SystemRunner {
    max_tail_bytes: usize,
}

impl SystemRunner {
    pub fn new(max_tail_bytes: usize) -> Self {
        Self { max_tail_bytes }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(10240)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, AgentError> {
        let command = spec.display();
        if cancel.is_cancelled() {
            return Err(AgentError::Aborted(format!("'{}' cancelled before start", command)));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Running '{}' (timeout {:?})", command, spec.timeout);
        let mut child = cmd.spawn().map_err(|e| AgentError::InvocationError {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        let stdout = tokio::spawn(read_tail(child.stdout.take(), self.max_tail_bytes));
        let stderr = tokio::spawn(read_tail(child.stderr.take(), self.max_tail_bytes));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(spec.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::TimedOut => {
                warn!("'{}' timed out after {:?}, killing it", command, spec.timeout);
                kill_process_group(&mut child).await;
                stdout.abort();
                stderr.abort();
                return Err(AgentError::TimeoutError {
                    command,
                    timeout: spec.timeout,
                });
            }
            Outcome::Cancelled => {
                warn!("'{}' cancelled, killing it", command);
                kill_process_group(&mut child).await;
                stdout.abort();
                stderr.abort();
                return Err(AgentError::Aborted(format!("'{}' was cancelled", command)));
            }
        };

        let output = CommandOutput {
            stdout: drain(stdout).await,
            stderr: drain(stderr).await,
            exit_code: status.code(),
        };

        if !output.stderr.trim().is_empty() {
            if output.exit_code == Some(0) {
                debug!("'{}' stderr: {}", command, output.stderr.trim());
            } else {
                warn!("'{}' stderr: {}", command, output.stderr.trim());
            }
        }
        debug!("'{}' exited with {:?}", command, output.exit_code);

        Ok(output)
    }
}

async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) only sends a signal; a negative pid targets the
            // process group created for this child.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn drain(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => String::new(),
    }
}

async fn read_tail<R>(reader: Option<R>, max: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > max.saturating_mul(2) {
                    let cut = kept.len() - max;
                    kept.drain(..cut);
                }
            }
        }
    }
    if kept.len() > max {
        let cut = kept.len() - max;
        kept.drain(..cut);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::cancel::cancel_pair;
    use std::time::Instant;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::shell("echo out; echo err >&2; exit 3", secs(10));
        let output = runner.run(&spec, &CancelToken::never()).await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(3));
        assert!(output.is_accepted(&[0, 3]));

        let err = output.check(&spec, &[0]).unwrap_err();
        assert!(matches!(err, AgentError::ScriptError { exit_code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_passes_env_and_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = SystemRunner::default();
        let spec = CommandSpec::shell("echo $DEPLOY_ID; pwd", secs(10))
            .env("DEPLOY_ID", "d-42")
            .cwd(tmp.path());
        let output = runner.run(&spec, &CancelToken::never()).await.unwrap();
        let lines: Vec<_> = output.stdout.lines().collect();
        assert_eq!(lines[0], "d-42");
        assert!(lines[1].ends_with(tmp.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_missing_program_is_invocation_error() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::new("/definitely/not/here", secs(5));
        let err = runner.run(&spec, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvocationError { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::shell("sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        let err = runner.run(&spec, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, AgentError::TimeoutError { .. }));
        assert!(started.elapsed() < secs(10));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let runner = SystemRunner::default();
        let (handle, token) = cancel_pair();
        let spec = CommandSpec::shell("sleep 30", secs(60));
        let run = tokio::spawn(async move { runner.run(&spec, &token).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let err = tokio::time::timeout(secs(10), run).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Aborted(_)));
    }

    #[tokio::test]
    async fn test_output_is_truncated_to_tail() {
        let runner = SystemRunner::new(16);
        let spec = CommandSpec::shell("seq 1 1000", secs(10));
        let output = runner.run(&spec, &CancelToken::never()).await.unwrap();
        assert!(output.stdout.len() <= 16);
        assert!(output.stdout.trim_end().ends_with("1000"));
    }
}
