//! Shell-based step execution on the host.

use crate::runner::{OUTPUT_FILE_VAR, OutputLine, OutputStream, RunnerConfig, parse_outputs};
use async_trait::async_trait;
use indexmap::IndexMap;
use jobgraph_core::ports::{StepExecutor, StepOutcome, StepRequest};
use jobgraph_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs `run:` steps as `<shell> -c <command>` child processes.
///
/// The child is killed if the returned future is dropped, so an instance
/// deadline or cancellation never leaves a process behind.
pub struct ShellExecutor {
    config: RunnerConfig,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

impl ShellExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            output_tx: None,
        }
    }

    /// Forward every output line to `tx` as it is produced.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    fn command(shell: &str, script: &str) -> Command {
        let mut command = Command::new(shell);
        match shell {
            "bash" => {
                command.args(["--noprofile", "--norc", "-eo", "pipefail", "-c"]);
            }
            "sh" => {
                command.args(["-e", "-c"]);
            }
            _ => {
                command.arg("-c");
            }
        }
        command.arg(script);
        command
    }

    fn environment(&self, request: &StepRequest, output_file: &Path) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        if self.config.inherit_env {
            env.extend(std::env::vars());
        } else if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        env.extend(request.env.clone());
        env.insert(
            OUTPUT_FILE_VAR.to_string(),
            output_file.display().to_string(),
        );
        env
    }

    fn stream<R>(
        &self,
        reader: R,
        step: &str,
        stream: OutputStream,
        capture_limit: usize,
    ) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.output_tx.clone();
        let step = step.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut captured = String::new();
            let mut line_number = 0u32;

            while let Ok(Some(line)) = lines.next_line().await {
                line_number += 1;
                match stream {
                    OutputStream::Stdout => debug!(step = %step, "{}", line),
                    OutputStream::Stderr => debug!(step = %step, stream = "stderr", "{}", line),
                }
                if captured.len() + line.len() < capture_limit {
                    if !captured.is_empty() {
                        captured.push('\n');
                    }
                    captured.push_str(&line);
                }
                if let Some(tx) = &tx {
                    let output = OutputLine {
                        step: step.clone(),
                        stream,
                        content: line,
                        line_number,
                        timestamp: chrono::Utc::now(),
                    };
                    // A closed receiver only stops forwarding; capture continues.
                    let _ = tx.send(output).await;
                }
            }
            captured
        })
    }

    async fn execute_command(&self, request: &StepRequest, output_file: &Path) -> Result<StepOutcome> {
        let start = std::time::Instant::now();

        info!(
            shell = %request.shell,
            workspace = %request.workspace.display(),
            "Executing shell command"
        );

        let mut child = Self::command(&request.shell, &request.command)
            .current_dir(&request.workspace)
            .env_clear()
            .envs(self.environment(request, output_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Executor(format!("Failed to spawn {}: {}", request.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Executor("Child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Executor("Child stderr not captured".to_string()))?;

        let stdout_handle = self.stream(
            stdout,
            &request.step,
            OutputStream::Stdout,
            self.config.max_captured_bytes,
        );
        let stderr_handle = self.stream(stderr, &request.step, OutputStream::Stderr, 0);

        let status = match timeout(request.timeout, child.wait()).await {
            Ok(result) => {
                result.map_err(|e| Error::Executor(format!("Failed to wait for process: {}", e)))?
            }
            Err(_) => {
                warn!(timeout_secs = request.timeout.as_secs(), "Command timed out, killing process");
                let _ = child.kill().await;
                return Err(Error::Timeout {
                    seconds: request.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_handle.await.unwrap_or_default();
        let _ = stderr_handle.await;

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );

        let outputs = match tokio::fs::read_to_string(output_file).await {
            Ok(content) => parse_outputs(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(StepOutcome {
            exit_code,
            stdout,
            outputs,
        })
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

/// Per-step output file, removed when the step finishes or is abandoned.
struct OutputFile(PathBuf);

impl OutputFile {
    async fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("jobgraph-output-{}", Uuid::new_v4()));
        tokio::fs::write(&path, b"").await?;
        Ok(Self(path))
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "Output file not removed");
        }
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome> {
        let output_file = OutputFile::create().await?;

        self.execute_command(request, &output_file.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgraph_core::RunId;
    use jobgraph_core::run::InstanceKey;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn request(command: &str, workspace: &Path) -> StepRequest {
        StepRequest {
            run_id: RunId::new(),
            instance: InstanceKey::unmatrixed("build"),
            step: "compile".to_string(),
            command: command.to_string(),
            shell: "sh".to_string(),
            env: IndexMap::new(),
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_success() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::default();

        let outcome = tokio_test::assert_ok!(
            executor.execute(&request("echo hello; echo world", dir.path())).await
        );
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "hello\nworld");
    }

    #[tokio::test]
    async fn test_shell_executor_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::default();

        let outcome = executor.execute(&request("exit 3", dir.path())).await.unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn test_env_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let executor = ShellExecutor::new(RunnerConfig {
            inherit_env: false,
            ..RunnerConfig::default()
        });

        let mut req = request("cat marker.txt; echo \" $TARGET\"", dir.path());
        req.env.insert("TARGET".into(), "linux".into());
        let outcome = executor.execute(&req).await.unwrap();
        assert_eq!(outcome.stdout, "present linux");
    }

    #[tokio::test]
    async fn test_outputs_from_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::default();

        let outcome = executor
            .execute(&request(
                "echo \"version=1.4.0\" >> \"$JOBGRAPH_OUTPUT\"; echo \"digest=abc\" >> \"$JOBGRAPH_OUTPUT\"",
                dir.path(),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.outputs.get("version").map(String::as_str), Some("1.4.0"));
        assert_eq!(outcome.outputs.get("digest").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_output_lines_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let executor = ShellExecutor::default().with_output(tx);

        executor
            .execute(&request("echo hello; echo oops >&2", dir.path()))
            .await
            .unwrap();
        drop(executor);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push((line.stream, line.content));
        }
        lines.sort_by_key(|(stream, _)| *stream == OutputStream::Stderr);
        assert_eq!(
            lines,
            vec![
                (OutputStream::Stdout, "hello".to_string()),
                (OutputStream::Stderr, "oops".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::default();
        let mut req = request("sleep 5", dir.path());
        req.timeout = Duration::from_millis(100);

        let err = executor.execute(&req).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
