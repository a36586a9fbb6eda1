//! One broker → worker round trip.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use askd_core::{WorkerRequest, WorkerResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send `request` to the worker at `socket` and wait up to `timeout` for
/// its single-line reply.
pub async fn call_worker(
    socket: &Path,
    request: &WorkerRequest,
    timeout: Duration,
) -> Result<WorkerResponse> {
    let exchange = async {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("worker socket {} refused connection", socket.display()))?;
        let (read_half, mut write_half) = stream.into_split();

        let payload = serde_json::to_string(request)?;
        write_half.write_all(payload.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("worker closed the connection without replying");
        }
        serde_json::from_str::<WorkerResponse>(line.trim()).context("worker sent a malformed reply")
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("worker did not reply within {}s", timeout.as_secs()))??;

    if response.instance_id != request.instance_id {
        bail!(
            "reply from instance {} on a socket for {}",
            response.instance_id,
            request.instance_id
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use askd_core::{ConfigAction, ErrorCode, RequestKind, WorkerReply};
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, reply: String) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        write_half.write_all(reply.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
    }

    fn get_request(id: &str) -> WorkerRequest {
        WorkerRequest::new(id, RequestKind::Config(ConfigAction::Get))
    }

    #[tokio::test]
    async fn round_trip_parses_reply() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("w.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let reply = WorkerResponse::error("abc", ErrorCode::InvalidProfile, "nope");
        tokio::spawn(serve_once(listener, serde_json::to_string(&reply).unwrap()));

        let got = call_worker(&socket, &get_request("abc"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!got.is_success());
        assert!(matches!(
            got.reply,
            WorkerReply::Error { error_code: ErrorCode::InvalidProfile, .. }
        ));
    }

    #[tokio::test]
    async fn reply_from_another_instance_is_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("w.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let reply = WorkerResponse::error("other", ErrorCode::ValidationError, "x");
        tokio::spawn(serve_once(listener, serde_json::to_string(&reply).unwrap()));

        let err = call_worker(&socket, &get_request("abc"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("instance other"));
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("w.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = call_worker(&socket, &get_request("abc"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not reply"));
    }

    #[tokio::test]
    async fn missing_socket_is_a_transport_error() {
        let dir = TempDir::new().unwrap();
        let err = call_worker(&dir.path().join("absent.sock"), &get_request("abc"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused connection"));
    }
}
