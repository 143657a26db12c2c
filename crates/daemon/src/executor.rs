//! PulseExecutor — launches the agent subprocess that carries out a pulse.
//!
//! The agent is invoked as
//! `<agent_cmd> --print --output-format stream-json --verbose
//! [--resume <session_id>] <prompt>` with the desk directory as its
//! working directory. Stdout and stderr are drained concurrently while
//! the child runs; stdout is then stream-parsed to recover the session id
//! and the agent's own error verdict.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use reeve_domain::pulse::truncate;
use reeve_domain::stream::StreamParser;

/// Default wall-clock budget for one agent session.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results and failures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Successful execution record.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timed_out: bool,
    /// Session id extracted from the stream, for `--resume` on follow-ups.
    pub session_id: Option<String>,
}

/// Execution failure taxonomy. Retry policy is the caller's concern; the
/// executor only classifies.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("agent command not found: {0}")]
    ExecutableMissing(String),

    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),

    #[error("agent execution timed out after {0}s")]
    Timeout(u64),

    #[error("agent exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("agent reported error: {0}")]
    Stream(String),

    #[error("spawning agent: {0}")]
    Spawn(std::io::Error),
}

/// Seam between the scheduler and the real subprocess, so dispatch logic
/// is testable without an agent binary on PATH.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, prompt: &str, session_id: Option<&str>)
        -> Result<ExecutionOutput, ExecError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PulseExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PulseExecutor {
    agent_command: String,
    desk_path: PathBuf,
    timeout: Duration,
}

impl PulseExecutor {
    pub fn new(agent_command: impl Into<String>, desk_path: impl Into<PathBuf>) -> Self {
        Self {
            agent_command: agent_command.into(),
            desk_path: desk_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append sticky notes to the base prompt. Notes are always appended,
    /// never prepended; no notes yields the bare prompt.
    pub fn build_prompt(base_prompt: &str, sticky_notes: Option<&[String]>) -> String {
        let notes = match sticky_notes {
            Some(notes) if !notes.is_empty() => notes,
            _ => return base_prompt.to_string(),
        };
        let mut parts = vec![base_prompt.to_string(), String::new()];
        parts.push("📌 Reminders:".to_string());
        for note in notes {
            parts.push(format!("  - {note}"));
        }
        parts.join("\n")
    }

    /// Run one agent session to completion under the wall-clock budget.
    pub async fn execute(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        timeout_override: Option<Duration>,
    ) -> Result<ExecutionOutput, ExecError> {
        let timeout = timeout_override.unwrap_or(self.timeout);

        if !self.desk_path.is_dir() {
            return Err(ExecError::WorkingDirMissing(self.desk_path.clone()));
        }

        let mut cmd = Command::new(&self.agent_command);
        cmd.args(["--print", "--output-format", "stream-json", "--verbose"]);
        if let Some(sid) = session_id {
            cmd.args(["--resume", sid]);
        }
        cmd.arg(prompt);
        cmd.current_dir(&self.desk_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            command = %self.agent_command,
            cwd = %self.desk_path.display(),
            timeout_s = timeout.as_secs(),
            resume = session_id.is_some(),
            prompt = %truncate(prompt, 50),
            "spawning agent"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::ExecutableMissing(self.agent_command.clone())
            } else {
                ExecError::Spawn(e)
            }
        })?;

        // Drain both pipes concurrently with the running child. Relying on
        // pipe EOF alone can deadlock once the child fills a pipe buffer.
        let stdout_task = drain_lines(child.stdout.take());
        let stderr_task = drain_lines(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecError::Spawn)?,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(timeout_s = timeout.as_secs(), "agent timed out, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(ExecError::Timeout(timeout.as_secs()));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let return_code = status.code().unwrap_or(-1);

        let summary = StreamParser::new().parse_all(&stdout);

        if return_code != 0 {
            return Err(ExecError::NonZeroExit {
                code: return_code,
                stderr: truncate(stderr.trim(), 500),
            });
        }
        if summary.is_error {
            return Err(ExecError::Stream(
                summary
                    .error_message
                    .unwrap_or_else(|| "agent stream reported an error".to_string()),
            ));
        }

        tracing::info!(
            session_id = summary.session_id.as_deref().unwrap_or("-"),
            tool_calls = summary.tool_call_count,
            "agent session completed"
        );

        Ok(ExecutionOutput {
            stdout,
            stderr,
            return_code,
            timed_out: false,
            session_id: summary.session_id,
        })
    }
}

#[async_trait]
impl AgentRunner for PulseExecutor {
    async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionOutput, ExecError> {
        self.execute(prompt, session_id, None).await
    }
}

/// Collect a pipe's lines into a string on a background task.
fn drain_lines(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(pipe) = pipe {
            let mut reader = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn prompt_without_notes_is_bare() {
        assert_eq!(PulseExecutor::build_prompt("Check the mail", None), "Check the mail");
        assert_eq!(
            PulseExecutor::build_prompt("Check the mail", Some(&[])),
            "Check the mail"
        );
    }

    #[test]
    fn prompt_appends_reminder_block() {
        let notes = vec!["reply to ski trip thread".to_string(), "review the PR".to_string()];
        let full = PulseExecutor::build_prompt("Morning briefing", Some(&notes));
        assert_eq!(
            full,
            "Morning briefing\n\n📌 Reminders:\n  - reply to ski trip thread\n  - review the PR"
        );
        assert!(full.starts_with("Morning briefing"), "notes are appended, never prepended");
    }

    /// Write a stand-in agent script that ignores its flags and prints a
    /// fixed stream-json capture.
    fn fake_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn execute_happy_path_extracts_session_id() {
        let desk = tempfile::tempdir().unwrap();
        let agent = fake_agent(
            desk.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-t1"}'
echo '{"type":"result","is_error":false}'"#,
        );

        let executor = PulseExecutor::new(agent.to_str().unwrap(), desk.path());
        let output = executor.execute("do the thing today", None, None).await.unwrap();
        assert_eq!(output.return_code, 0);
        assert!(!output.timed_out);
        assert_eq!(output.session_id.as_deref(), Some("sess-t1"));
        assert!(output.stdout.contains("sess-t1"));
    }

    #[tokio::test]
    async fn execute_missing_workdir_fails_fast() {
        let executor = PulseExecutor::new("hapi", "/definitely/not/a/real/desk");
        let err = executor.execute("anything at all", None, None).await.unwrap_err();
        assert!(matches!(err, ExecError::WorkingDirMissing(_)), "{err}");
    }

    #[tokio::test]
    async fn execute_missing_executable() {
        let desk = tempfile::tempdir().unwrap();
        let executor = PulseExecutor::new("reeve-no-such-agent-cmd", desk.path());
        let err = executor.execute("anything at all", None, None).await.unwrap_err();
        assert!(matches!(err, ExecError::ExecutableMissing(_)), "{err}");
    }

    #[tokio::test]
    async fn execute_nonzero_exit_carries_stderr() {
        let desk = tempfile::tempdir().unwrap();
        let agent = fake_agent(desk.path(), "echo 'model overloaded' >&2\nexit 3");
        let executor = PulseExecutor::new(agent.to_str().unwrap(), desk.path());
        let err = executor.execute("try anyway please", None, None).await.unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("model overloaded"));
            }
            other => panic!("expected NonZeroExit, got {other}"),
        }
    }

    #[tokio::test]
    async fn execute_stream_error_on_clean_exit() {
        let desk = tempfile::tempdir().unwrap();
        let agent = fake_agent(
            desk.path(),
            r#"echo '{"type":"result","is_error":true,"errors":["Error: tool blew up"]}'"#,
        );
        let executor = PulseExecutor::new(agent.to_str().unwrap(), desk.path());
        let err = executor.execute("run the tool again", None, None).await.unwrap_err();
        assert!(matches!(&err, ExecError::Stream(m) if m.contains("tool blew up")), "{err}");
    }

    #[tokio::test]
    async fn execute_timeout_kills_child() {
        let desk = tempfile::tempdir().unwrap();
        let agent = fake_agent(desk.path(), "sleep 30");
        let executor = PulseExecutor::new(agent.to_str().unwrap(), desk.path());
        let start = std::time::Instant::now();
        let err = executor
            .execute("sleep forever", None, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)), "{err}");
        assert!(start.elapsed() < Duration::from_secs(5), "kill must not wait for the child");
    }
}
