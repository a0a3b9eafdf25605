//! Local HTTP stub for client tests.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// `(status, content type, body)`
pub type StubResponse = (u16, &'static str, Vec<u8>);

/// Maps a request line (`"POST /path?query"`) to a response.
pub type Handler = dyn Fn(&str) -> StubResponse + Send + Sync;

/// Serve HTTP/1.1 on an ephemeral port, one request per connection.
/// Returns the base URL.
pub async fn serve(handler: Arc<Handler>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
                let content_length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let mut remaining = content_length.saturating_sub(buf.len() - head_end);
                while remaining > 0 {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    remaining = remaining.saturating_sub(n);
                }

                let request_line: String = head
                    .lines()
                    .next()
                    .unwrap_or("")
                    .rsplit_once(' ')
                    .map(|(rest, _version)| rest.to_string())
                    .unwrap_or_default();
                let (status, content_type, body) = handler(&request_line);
                let header = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

pub fn json(body: &str) -> StubResponse {
    (200, "application/json", body.as_bytes().to_vec())
}
