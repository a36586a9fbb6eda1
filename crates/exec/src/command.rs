use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use askd_config::BackendConfig;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Backend, BackendError, BackendOutput, parse_events};

const MAX_STDERR_IN_ERROR: usize = 500;

/// Runs an external command per prompt: prompt on stdin, JSON events on
/// stdout.  The child is killed if the call times out.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }
}

#[async_trait]
impl Backend for CommandBackend {
    async fn invoke(&self, prompt: &str) -> Result<BackendOutput, BackendError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BackendError::NotFound {
                    program: self.program.clone(),
                },
                _ => BackendError::Io(err),
            })?;

        debug!(program = %self.program, pid = child.id(), bytes = prompt.len(), "backend started");

        // Feed stdin concurrently so a child that writes before reading cannot
        // deadlock against a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    if err.kind() != ErrorKind::BrokenPipe {
                        warn!(?err, "writing prompt to backend failed");
                    }
                }
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::TimedOut {
                secs: self.timeout.as_secs().max(1),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut stderr = stderr.trim().to_string();
            if stderr.len() > MAX_STDERR_IN_ERROR {
                let mut end = MAX_STDERR_IN_ERROR;
                while end > 0 && !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr.truncate(end);
                stderr.push('…');
            }
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(BackendError::NonZeroExit { code, stderr });
        }

        parse_events(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandBackend {
        CommandBackend::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let backend = sh("cat", Duration::from_secs(5));
        let out = backend.invoke("hello backend").await.unwrap();
        assert_eq!(out.answer, "hello backend");
    }

    #[tokio::test]
    async fn json_events_are_parsed() {
        let backend = sh(
            r#"cat >/dev/null; echo '{"type":"item.completed","item":{"type":"agent_message","text":"4"}}'"#,
            Duration::from_secs(5),
        );
        assert_eq!(backend.invoke("2+2?").await.unwrap().answer, "4");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let backend = CommandBackend::new(
            "/definitely/not/a/real/askd-backend",
            Vec::new(),
            Duration::from_secs(5),
        );
        let err = backend.invoke("x").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));
        assert_eq!(err.code(), askd_core::ErrorCode::BackendNotFound);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let backend = sh("echo broken >&2; exit 3", Duration::from_secs(5));
        match backend.invoke("x").await.unwrap_err() {
            BackendError::NonZeroExit { code, stderr } => {
                assert_eq!(code, "3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = sh("sleep 5", Duration::from_millis(200));
        let err = backend.invoke("x").await.unwrap_err();
        assert!(matches!(err, BackendError::TimedOut { .. }));
        assert_eq!(err.code(), askd_core::ErrorCode::BackendTimeout);
        assert!(err.to_string().contains("timed out"));
    }
}
