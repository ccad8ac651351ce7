use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::error::FetchError;
use crate::hashing::hex_encode;

#[derive(Debug)]
pub(crate) struct FetchedArchive {
    pub(crate) bytes: Vec<u8>,
    pub(crate) total_size: u64,
    pub(crate) sha256: String,
}

/// Streaming GET of one release archive. The progress callback receives the
/// cumulative byte count and the declared total (0 when Content-Length is
/// absent) after every chunk; the cancel predicate is checked between
/// chunks.
pub(crate) async fn fetch_archive(
    url: &str,
    timeout: Duration,
    should_cancel: impl Fn() -> bool,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<FetchedArchive, FetchError> {
    // Release assets are served from a fixed upstream host; certificate
    // validation is intentionally relaxed for this client only.
    let client = Client::builder()
        .user_agent("cellar-agent")
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .map_err(FetchError::Build)?;

    let resp = client.get(url).send().await.map_err(map_send_error)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }

    let total_size = resp.content_length().unwrap_or(0);
    let mut bytes: Vec<u8> = Vec::new();
    let mut hasher = Sha256::new();
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if should_cancel() {
            return Err(FetchError::Cancelled);
        }
        let chunk = chunk.map_err(map_send_error)?;
        hasher.update(&chunk);
        bytes.extend_from_slice(&chunk);
        on_progress(bytes.len() as u64, total_size);
    }

    Ok(FetchedArchive {
        bytes,
        total_size,
        sha256: hex_encode(&hasher.finalize()),
    })
}

fn map_send_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let header = format!(
                "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(header.as_bytes()).await.expect("header");
            // Write the body in small pieces so the client sees several chunks.
            for piece in body.chunks(200) {
                stream.write_all(piece).await.expect("body");
                stream.flush().await.expect("flush");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        format!("http://{addr}/archive.tar.gz")
    }

    #[tokio::test]
    async fn streams_body_and_reports_cumulative_progress() {
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let url = serve_once("HTTP/1.1 200 OK", body.clone()).await;

        let mut seen = Vec::new();
        let fetched = fetch_archive(
            &url,
            Duration::from_secs(10),
            || false,
            |downloaded, total| seen.push((downloaded, total)),
        )
        .await
        .expect("fetch");

        assert_eq!(fetched.bytes, body);
        assert_eq!(fetched.total_size, 1000);
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0), "monotonic");
        assert_eq!(seen.last().expect("progress"), &(1000, 1000));
        assert_eq!(fetched.sha256.len(), 64);
    }

    #[tokio::test]
    async fn non_success_status_fails_before_buffering() {
        let url = serve_once("HTTP/1.1 404 Not Found", b"gone".to_vec()).await;
        let mut called = false;
        let err = fetch_archive(&url, Duration::from_secs(10), || false, |_, _| called = true)
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::Status(404)));
        assert!(!called, "no progress on error responses");
    }

    #[tokio::test]
    async fn cancel_predicate_aborts_the_stream() {
        let body = vec![0u8; 4000];
        let url = serve_once("HTTP/1.1 200 OK", body).await;
        let err = fetch_archive(&url, Duration::from_secs(10), || true, |_, _| {})
            .await
            .expect_err("should cancel");
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn connection_failure_is_a_network_error() {
        // Nothing listens on this port; bind-and-drop reserves then frees it.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let url = format!("http://{addr}/archive.tar.gz");
        let err = fetch_archive(&url, Duration::from_secs(2), || false, |_, _| {})
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::Network(_) | FetchError::Timeout));
    }
}
