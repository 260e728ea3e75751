//! Agent Runner: spawns the coding agent for one phase attempt.
//!
//! The agent is launched as `<program> <args...> <instructions.md>` with its
//! working directory set to the phase output directory. Untrusted content
//! reaches it only through the instruction file, never through argv.
//!
//! Completion is signalled out of band: the agent's end-of-session hook
//! writes the completion marker. Closing stdout is not completion; the
//! runner keeps waiting for the process to exit and then checks the marker.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::config::AgentSettings;
use crate::errors::AgentError;
use crate::stream::{AgentEvent, classify_line};

/// Callback receiving agent events as soon as each line is read.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Cooperative cancellation signal shared between a job and its agent runs.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to launch one agent attempt.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub phase_id: String,
    pub attempt: u32,
    pub instructions_path: PathBuf,
    /// Phase output directory; the agent's cwd.
    pub working_dir: PathBuf,
    pub marker_path: PathBuf,
    pub timeout: Duration,
}

/// Outcome of an agent attempt that exited cleanly with the marker present.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub cost_usd: Option<f64>,
    pub output_lines: u64,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn execute(
        &self,
        invocation: &AgentInvocation,
        sink: EventSink,
        cancel: &CancelToken,
    ) -> Result<AgentRun, AgentError>;
}

/// Runs the agent as a child process.
pub struct ProcessAgentRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessAgentRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.command.clone(), settings.args.clone())
    }

    fn command(&self, invocation: &AgentInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&invocation.instructions_path)
            .current_dir(&invocation.working_dir)
            .env("EVOLVE_COMPLETION_MARKER", &invocation.marker_path)
            .env("EVOLVE_OUTPUT_DIR", &invocation.working_dir)
            .env("EVOLVE_PHASE_ID", &invocation.phase_id)
            .env("EVOLVE_ATTEMPT", invocation.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn execute(
        &self,
        invocation: &AgentInvocation,
        sink: EventSink,
        cancel: &CancelToken,
    ) -> Result<AgentRun, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // A marker left by an earlier attempt must not count for this one.
        match std::fs::remove_file(&invocation.marker_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::Io(e)),
        }
        std::fs::create_dir_all(&invocation.working_dir)?;

        let start = Instant::now();
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        tracing::info!(
            phase = %invocation.phase_id,
            attempt = invocation.attempt,
            pid = child.id().unwrap_or(0),
            "Agent process spawned"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Io(std::io::Error::other("agent stdout not captured")))?;
        let stderr_task = child.stderr.take().map(|stderr| {
            let phase_id = invocation.phase_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(phase = %phase_id, stderr = %line, "Agent stderr");
                }
            })
        });

        let mut reader = BufReader::new(stdout).lines();
        let mut stdout_open = true;
        let mut output_lines: u64 = 0;
        let mut cost_usd = None;
        let deadline = tokio::time::sleep(invocation.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                line = reader.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        output_lines += 1;
                        for event in classify_line(&line) {
                            if let AgentEvent::Result { cost_usd: Some(cost), .. } = &event {
                                cost_usd = Some(*cost);
                            }
                            sink(event);
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::warn!(phase = %invocation.phase_id, error = %e, "Failed to read agent stdout");
                        stdout_open = false;
                    }
                },
                status = child.wait(), if !stdout_open => break status?,
                _ = &mut deadline => {
                    kill_tree(&mut child).await;
                    tracing::warn!(
                        phase = %invocation.phase_id,
                        attempt = invocation.attempt,
                        timeout_secs = invocation.timeout.as_secs(),
                        "Agent timed out"
                    );
                    return Err(AgentError::Timeout { secs: invocation.timeout.as_secs() });
                }
                _ = cancel.cancelled() => {
                    kill_tree(&mut child).await;
                    tracing::info!(phase = %invocation.phase_id, attempt = invocation.attempt, "Agent cancelled");
                    return Err(AgentError::Cancelled);
                }
            }
        };

        if let Some(task) = stderr_task {
            // A detached grandchild may still hold stderr open.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        let exit_code = status.code();
        let duration = start.elapsed();
        tracing::info!(
            phase = %invocation.phase_id,
            attempt = invocation.attempt,
            exit_code = ?exit_code,
            duration_ms = duration.as_millis() as u64,
            "Agent process exited"
        );

        if !status.success() {
            return Err(AgentError::NonZeroExit { exit_code });
        }
        if !invocation.marker_path.exists() {
            return Err(AgentError::MissingCompletionMarker { exit_code });
        }

        Ok(AgentRun {
            exit_code,
            duration,
            cost_usd,
            output_lines,
        })
    }
}

/// Terminate the child and everything in its process group.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) with a negative pid signals the process group
            // that was created for this child at spawn time.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Agent process already gone");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        invocation: AgentInvocation,
        runner: ProcessAgentRunner,
    }

    fn fixture(script: &str, timeout: Duration) -> Fixture {
        let dir = tempdir().unwrap();
        let phase_dir = dir.path().join("phases/build");
        let output = phase_dir.join("output");
        fs::create_dir_all(&output).unwrap();
        let script_path = dir.path().join("agent.sh");
        fs::write(&script_path, script).unwrap();
        let instructions = phase_dir.join("attempts/1/instructions.md");
        fs::create_dir_all(instructions.parent().unwrap()).unwrap();
        fs::write(&instructions, "do it").unwrap();

        Fixture {
            invocation: AgentInvocation {
                phase_id: "build".into(),
                attempt: 1,
                instructions_path: instructions,
                working_dir: output,
                marker_path: phase_dir.join(".phase-complete"),
                timeout,
            },
            runner: ProcessAgentRunner::new("sh", vec![script_path.display().to_string()]),
            _dir: dir,
        }
    }

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<AgentEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |e| captured.lock().unwrap().push(e));
        (sink, events)
    }

    #[tokio::test]
    async fn test_successful_run_streams_events() {
        let f = fixture(
            r#"
echo '{"type":"text","text":"working"}'
echo 'plain noise'
mkdir -p new && echo hi > new/a.txt
echo '{"type":"result","is_error":false,"total_cost_usd":0.5}'
touch "$EVOLVE_COMPLETION_MARKER"
"#,
            Duration::from_secs(10),
        );
        let (sink, events) = collecting_sink();
        let run = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.output_lines, 3);
        assert_eq!(run.cost_usd, Some(0.5));
        assert!(f.invocation.working_dir.join("new/a.txt").exists());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], AgentEvent::Unknown { .. }));
    }

    #[tokio::test]
    async fn test_closed_stdout_is_not_completion() {
        let f = fixture(
            r#"
echo '{"type":"text","text":"closing stdout early"}'
exec 1>&-
sleep 0.3
touch "$EVOLVE_COMPLETION_MARKER"
"#,
            Duration::from_secs(10),
        );
        let (sink, _) = collecting_sink();
        let run = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap();
        assert!(run.duration >= Duration::from_millis(250));
        assert!(f.invocation.marker_path.exists());
    }

    #[tokio::test]
    async fn test_missing_marker_fails() {
        let f = fixture("echo done\n", Duration::from_secs(10));
        let (sink, _) = collecting_sink();
        let err = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingCompletionMarker { .. }));
    }

    #[tokio::test]
    async fn test_stale_marker_is_cleared_before_run() {
        let f = fixture("exit 0\n", Duration::from_secs(10));
        fs::write(&f.invocation.marker_path, "").unwrap();
        let (sink, _) = collecting_sink();
        let err = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingCompletionMarker { .. }));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let f = fixture(
            "touch \"$EVOLVE_COMPLETION_MARKER\"\nexit 3\n",
            Duration::from_secs(10),
        );
        let (sink, _) = collecting_sink();
        let err = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::NonZeroExit { exit_code: Some(3) }
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let f = fixture("sleep 30\n", Duration::from_millis(300));
        let (sink, _) = collecting_sink();
        let start = Instant::now();
        let err = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_terminates_agent() {
        let f = fixture("sleep 30\n", Duration::from_secs(60));
        let (sink, _) = collecting_sink();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let err = f
            .runner
            .execute(&f.invocation, sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut f = fixture("exit 0\n", Duration::from_secs(5));
        f.runner = ProcessAgentRunner::new("/nonexistent/evolve-agent", vec![]);
        let (sink, _) = collecting_sink();
        let err = f
            .runner
            .execute(&f.invocation, sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed { .. }));
        assert_eq!(err.category(), crate::errors::FailureCategory::Transient);
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
