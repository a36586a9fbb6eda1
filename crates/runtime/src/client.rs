use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use askd_core::{ClientRequest, DaemonReply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

/// Connection attempts before a request gives up.
pub const CONNECT_ATTEMPTS: usize = 5;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    reply_timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Connect, retrying with exponential backoff (100 ms doubling, capped at
    /// 2 s).  Only connection establishment is ever retried.
    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<UnixStream> {
        let attempts = max_attempts.max(1);
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(err) if attempt >= attempts => {
                    return Err(err).with_context(|| {
                        format!(
                            "cannot reach askd at {} after {attempts} attempts",
                            self.socket_path.display()
                        )
                    });
                }
                Err(err) => {
                    warn!(attempt, ?err, "daemon connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
    }

    /// Send one request and wait for the daemon's reply.  Once the request
    /// has been written it is never re-sent.
    pub async fn request(&self, request: &ClientRequest) -> Result<DaemonReply> {
        let stream = self.connect_with_backoff(CONNECT_ATTEMPTS).await?;
        let (read_half, mut write_half) = stream.into_split();

        let payload = serde_json::to_string(request)?;
        write_half.write_all(payload.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let read = tokio::time::timeout(self.reply_timeout, reader.read_line(&mut line))
            .await
            .with_context(|| {
                format!("no reply from askd within {}s", self.reply_timeout.as_secs())
            })?;
        if read? == 0 {
            bail!("askd closed the connection without replying");
        }
        serde_json::from_str(line.trim()).context("askd sent a malformed reply")
    }
}
